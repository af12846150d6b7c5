mod client_state;
mod config;
mod constants;
mod error;
mod fragment;
mod header;
mod io_thread;
mod metrics;
mod patp;
mod protocol;
mod request_flow;
mod response_flow;
mod response_queue;
mod ring;
mod ring_types;
mod store;
mod store_worker;

use std::os::unix::io::{IntoRawFd, RawFd};
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use clap::Parser;
use socket2::{Domain, Protocol, Socket, Type};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use config::{
    Config, DEFAULT_CHUNK_SIZE, DEFAULT_CLUSTER_FILE, DEFAULT_MAX_SET_OPS_PER_TX, DEFAULT_PORT,
    DEFAULT_TX_BUFFERING, DEFAULT_TX_SIZE, RESPONSE_QUEUE_CAPACITY,
};
use io_thread::IoThread;
use response_queue::build_response_channel;
use store::FdbEventStore;
use store_worker::{new_registry, StoreWorker};

#[derive(Parser)]
#[command(about = "seguro: append-only per-ship event log fronted by a small TCP protocol")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Max bytes committed per FDB transaction
    #[arg(short, long, default_value_t = DEFAULT_TX_SIZE)]
    tx_size: u64,

    /// Fragment size (bytes per non-final fragment)
    #[arg(short, long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: u64,

    /// How many tx_size-sized buckets fit in a connection's read buffer
    #[arg(short = 'b', long, default_value_t = DEFAULT_TX_BUFFERING)]
    tx_buffering: u64,

    /// Path to the FDB cluster file
    #[arg(short = 'd', long = "cluster-file", default_value = DEFAULT_CLUSTER_FILE)]
    cluster_file: String,

    /// Raise log verbosity; repeat for more (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn verbosity_to_level_filter(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

fn create_listener(port: u16) -> anyhow::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .context("failed to create listening socket")?;
    socket.set_reuse_address(true).context("failed to set SO_REUSEADDR")?;

    unsafe {
        use std::os::unix::io::AsRawFd;
        let optval: libc::c_int = 1;
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    socket.set_nonblocking(true).context("failed to set O_NONBLOCK")?;
    socket.set_nodelay(true).context("failed to set TCP_NODELAY")?;

    let addr = std::net::SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&addr.into()).context("failed to bind listening socket")?;
    socket.listen(1024).context("failed to listen")?;
    Ok(socket)
}

fn create_eventfd() -> anyhow::Result<RawFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error()).context("failed to create eventfd");
    }
    Ok(fd)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(verbosity_to_level_filter(args.verbose).into())
                .from_env_lossy(),
        )
        .init();

    let config = Config::from_knobs(
        args.tx_size,
        args.chunk_size,
        args.tx_buffering,
        args.port,
        args.cluster_file.clone(),
        DEFAULT_MAX_SET_OPS_PER_TX,
    )
    .context("invalid configuration")?;

    tracing::info!(
        port = config.port,
        tx_size = config.tx_size,
        chunk_size = config.chunk_size,
        tx_buffering = config.tx_buffering,
        cluster_file = %config.cluster_file,
        "seguro starting"
    );

    metrics::spawn_reporter();

    // Safety: the guard must outlive every FDB operation; main holds it for
    // the life of the process and drops it only after both threads join.
    let _fdb_network = unsafe { foundationdb::boot() };

    let db = foundationdb::Database::new(Some(&config.cluster_file))
        .context("failed to open FDB cluster file")?;
    let store = Arc::new(FdbEventStore::new(db, config));

    let registry = new_registry();
    let efd = create_eventfd()?;
    let (resp_prod, resp_cons) = build_response_channel(RESPONSE_QUEUE_CAPACITY, efd);

    let worker_registry = registry.clone();
    let store_handle = thread::Builder::new()
        .name("store-worker".into())
        .spawn(move || {
            let mut worker = StoreWorker::new(store, worker_registry, resp_prod);
            worker.run();
        })
        .context("failed to spawn store-worker thread")?;

    let listen_socket = create_listener(config.port)?;
    let io = IoThread {
        listen_fd: listen_socket.into_raw_fd(),
        eventfd: efd,
        response_consumer: resp_cons,
        registry,
        config,
    };
    let io_handle = thread::Builder::new()
        .name("io".into())
        .spawn(move || io.run())
        .context("failed to spawn IO thread")?;

    tracing::info!("seguro ready");

    let _ = io_handle.join();
    let _ = store_handle.join();
    Ok(())
}
