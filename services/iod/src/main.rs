use clap::{App, Arg};
use crossbar::name::server::NameServer;
use crossbar::noc::NodeId;
use crossbar::rmem::server::RmemServer;
use crossbar::transport::{Loopback, Transport};
use girder::logging;
use std::sync::Arc;
use std::thread;

mod config;

use config::IodConfig;

pub fn main() {
    let matches = App::new("I/O Cluster Daemon")
        .version("1.0")
        .author("Crossbar Maintainers")
        .about("Runs the name and remote memory servers.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the config file")
                .required(false),
        )
        .get_matches();

    let config = match matches.value_of("CONFIG_FILE") {
        Some(path) => IodConfig::load(path),
        None => IodConfig::default(),
    };

    // Initialize logging
    let log = logging::init_with_level(&config.logging.level);

    let fabric = Arc::new(Loopback::with_log(&log));

    // The name server boots first so the rmem instances can register.
    let name_node = NodeId::new(config.name.node).expect("name server node out of range");
    let port: Arc<dyn Transport> = Arc::new(fabric.attach(name_node));
    let name_server = NameServer::new(port, name_node, &log).expect("name server setup failed");

    let mut workers = vec![thread::Builder::new()
        .name("name-server".to_string())
        .spawn(move || name_server.run())
        .expect("name server thread spawn failed")];

    for serverid in 0..config.rmem.servers {
        let node = NodeId::new(config.rmem.first_node + serverid)
            .expect("rmem server node out of range");
        let port: Arc<dyn Transport> = Arc::new(fabric.attach(node));
        let server = RmemServer::new(port, node, serverid, config.rmem.servers, &log)
            .expect("rmem server setup failed");

        workers.push(
            thread::Builder::new()
                .name(format!("rmem-server-{}", serverid))
                .spawn(move || server.run())
                .expect("rmem server thread spawn failed"),
        );
    }

    logging::info!(log, "i/o cluster daemon up"; "rmem_servers" => config.rmem.servers);

    for worker in workers {
        worker.join().expect("server thread panicked");
    }

    logging::info!(log, "i/o cluster daemon down");
}
