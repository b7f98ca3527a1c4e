use std::collections::HashMap;
use std::sync::Arc;
use anyhow::Result;
use log::{debug, trace};
use procfs::process::{all_processes, FDTarget, Process as Proc};
use crate::data::Process;

pub struct Registry {
    by_inode: HashMap<u64, Arc<Process>>,
    cmdline:  bool,
    environ:  bool,
}

impl Registry {
    pub fn new(cmdline: bool, environ: bool) -> Self {
        Self {
            by_inode: HashMap::new(),
            cmdline,
            environ,
        }
    }

    pub fn lookup(&mut self, inode: u64) -> Option<Arc<Process>> {
        if inode == 0 {
            return None;
        }

        if let Some(process) = self.by_inode.get(&inode) {
            return Some(process.clone());
        }

        if let Err(e) = self.refresh() {
            debug!("process scan failed: {:?}", e);
        }

        self.by_inode.get(&inode).cloned()
    }

    pub fn refresh(&mut self) -> Result<()> {
        let mut by_inode = HashMap::new();

        for proc in all_processes()? {
            // processes exit mid-scan, skip whatever can't be read
            let process = match self.describe(&proc) {
                Some(process) => Arc::new(process),
                None          => continue,
            };

            for inode in &process.inodes {
                by_inode.insert(*inode, process.clone());
            }
        }

        trace!("scanned {} socket inodes", by_inode.len());

        self.by_inode = by_inode;

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.by_inode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_inode.is_empty()
    }

    fn describe(&self, proc: &Proc) -> Option<Process> {
        let inodes = proc.fd().ok()?.into_iter().filter_map(|fd| {
            match fd.target {
                FDTarget::Socket(inode) => Some(u64::from(inode)),
                _                       => None,
            }
        }).collect::<Vec<_>>();

        if inodes.is_empty() {
            return None;
        }

        let binary = match proc.exe() {
            Ok(path) => path.to_string_lossy().into_owned(),
            Err(_)   => proc.stat.comm.clone(),
        };

        let cmdline = match self.cmdline {
            true  => proc.cmdline().map(|args| args.join(" ")).unwrap_or_default(),
            false => String::new(),
        };

        let environ = match self.environ {
            true  => proc.environ().map(|env| {
                let mut env = env.iter().map(|(k, v)| {
                    format!("{}={}", k.to_string_lossy(), v.to_string_lossy())
                }).collect::<Vec<_>>();
                env.sort();
                env
            }).unwrap_or_default(),
            false => Vec::new(),
        };

        Some(Process {
            pid:     proc.pid(),
            binary,
            cmdline,
            environ,
            inodes,
        })
    }
}
