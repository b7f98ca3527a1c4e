use std::time::Duration;
use anyhow::Result;
use env_logger::Builder;
use gumdrop::Options;
use log::{debug, LevelFilter};
use connwatch::config::{parse_duration, Config};
use connwatch::export::Exporter;
use connwatch::sink::Sink;
use connwatch::source::listen;

#[derive(Options)]
pub struct Args {
    #[options()]
    help: bool,
    #[options(no_short, meta = "BOOL")]
    expose_process_info: Option<bool>,
    #[options(no_short, meta = "BOOL")]
    expose_container_process_info: Option<bool>,
    #[options(no_short, meta = "BOOL")]
    expose_cmdline: Option<bool>,
    #[options(no_short, meta = "BOOL")]
    expose_environ: Option<bool>,
    #[options(no_short, meta = "BOOL")]
    enable_local_connections: Option<bool>,
    #[options(no_short, meta = "BOOL")]
    enable_docker: Option<bool>,
    #[options(no_short, meta = "BOOL")]
    enable_tcp_diag: Option<bool>,
    #[options(no_short, meta = "DURATION", parse(try_from_str = "parse_duration"))]
    poll_interval: Option<Duration>,
    #[options(no_short, meta = "DURATION", parse(try_from_str = "parse_duration"))]
    aggregation: Option<Duration>,
    #[options(no_short, meta = "NAME")]
    docker_environment: Vec<String>,
    #[options()]
    sink: Option<Sink>,
    #[options(count)]
    verbose: u32,
}

impl Args {
    fn config(&self) -> Config {
        let default = Config::default();
        let flag    = |v: Option<bool>, default: bool| v.unwrap_or(default);

        Config {
            expose_process_info:           flag(self.expose_process_info, default.expose_process_info),
            expose_container_process_info: flag(self.expose_container_process_info, default.expose_container_process_info),
            expose_cmdline:                flag(self.expose_cmdline, default.expose_cmdline),
            expose_environ:                flag(self.expose_environ, default.expose_environ),
            enable_local_connections:      flag(self.enable_local_connections, default.enable_local_connections),
            enable_docker:                 flag(self.enable_docker, default.enable_docker),
            enable_tcp_diag:               flag(self.enable_tcp_diag, default.enable_tcp_diag),
            poll_interval:                 self.poll_interval.unwrap_or(default.poll_interval),
            aggregation:                   self.aggregation.unwrap_or(default.aggregation),
            docker_environment:            self.docker_environment.clone(),
            queue_size:                    default.queue_size,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = Args::parse_args_default_or_exit();
    let config   = args.config();
    let sink     = args.sink.take().unwrap_or_default();

    let mut builder = Builder::from_default_env();
    builder.filter(None, match args.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    });
    builder.init();

    debug!("{:?}", config);

    let hostname = hostname::get()?.to_string_lossy().into_owned();
    let pipeline = listen(&config).await?;

    Exporter::new(hostname).run(pipeline, sink).await
}
