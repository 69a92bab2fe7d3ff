use std::io::{self, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn, LevelFilter};

use vrouter_agent::agent::{Agent, AgentConfig};
use vrouter_agent::flow::{
    FlowExportSink, JsonlExportSink, SimKernelFlowTable, SystemClock,
};

fn usage(exe: &str) {
    eprintln!(
        "usage: {exe} [--xmpp_server_1=IP] [--xmpp_server_2=IP] [--dns_server_1=IP] \
         [--dns_server_2=IP] [--discovery_server=IP] [--xmpp_instance_count=N] \
         [--vhost_name=IF] [--eth_port=IF] [--host_name=NAME] [--http_server_port=PORT] \
         [--tunnel_type=MPLSoGRE|MPLSoUDP|VXLAN] [--log_local] [--log_category=CAT] \
         [--log_level=LEVEL] [--collector=IP --collector_port=PORT] \
         [--metadata_shared_secret=SECRET]"
    );
}

fn init_logging(config: &AgentConfig) {
    let level = match config.log_level.as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" | "warning" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => LevelFilter::Info,
    };
    let mut builder = env_logger::Builder::from_default_env();
    if config.log_category.is_empty() {
        builder.filter_level(level);
    } else {
        builder.filter_module(&config.log_category, level);
    }
    builder.init();
}

/// Connects the export sink: the configured collector endpoint, or
/// stdout when none is configured.
fn make_sink(config: &AgentConfig) -> Arc<dyn FlowExportSink> {
    if let (Some(collector), port) = (&config.collector, config.collector_port) {
        if port != 0 {
            match TcpStream::connect((collector.as_str(), port)) {
                Ok(stream) => {
                    info!("flow export to collector {collector}:{port}");
                    return Arc::new(JsonlExportSink::new(Box::new(stream)));
                }
                Err(err) => {
                    warn!("collector {collector}:{port} unreachable ({err}); exporting to stdout");
                }
            }
        }
    }
    Arc::new(JsonlExportSink::new(Box::new(io::stdout())))
}

fn main() {
    let mut args = std::env::args();
    let exe = args.next().unwrap_or_else(|| "vrouter-agent".to_string());

    let raw: Vec<String> = args.collect();
    if raw.iter().any(|a| a == "--help" || a == "-h") {
        usage(&exe);
        return;
    }

    let config = match AgentConfig::parse_args(raw.into_iter()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{exe}: {err}");
            usage(&exe);
            std::process::exit(2);
        }
    };

    init_logging(&config);

    let sink = make_sink(&config);
    // The netlink transport attaches here in a full deployment; until
    // then the kernel view is the in-memory table.
    let kernel = Arc::new(SimKernelFlowTable::new());
    let clock = Arc::new(SystemClock);

    let agent = Agent::new(config, sink, kernel, clock);
    agent.create_default_vrfs();
    agent.start();

    // Periodic liveness line; all real work happens on scheduler tasks.
    loop {
        std::thread::sleep(Duration::from_secs(60));
        for line in agent.diagnostics() {
            info!("{line}");
        }
        let _ = io::stdout().flush();
    }
}
