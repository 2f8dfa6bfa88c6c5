use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use mvirt_shim::bootstrap;
use mvirt_shim::config::{Action, Args};
use mvirt_shim::proto::task_service_server::TaskServiceServer;
use mvirt_shim::runtime::CliRuntimeProvider;
use mvirt_shim::services::events::{self, QUEUE_CAPACITY};
use mvirt_shim::services::task::{CgroupAdapter, TaskApiHandler, TaskService};
use mvirt_shim::utils::reaper::Reaper;
use tokio::signal::unix::{SignalKind, signal};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How long in-flight streams may keep the server alive after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse_normalized(std::env::args_os());

    let level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(format!("mvirt_shim={level}").parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.action {
        Some(Action::Start) => {
            let params = bootstrap::start(&args)?;
            println!("{}", serde_json::to_string(&params)?);
        }
        Some(Action::Delete) => {
            let reaper = Reaper::new();
            let _sigchld = reaper.spawn_sigchld_loop()?;
            let response = bootstrap::delete(&args, reaper).await?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&bootstrap::encode_delete_response(&response))?;
            stdout.flush()?;
        }
        None => serve(args).await?,
    }

    Ok(())
}

async fn serve(args: Args) -> anyhow::Result<()> {
    nix::sys::prctl::set_child_subreaper(true)?;

    let reaper = Reaper::new();
    let _sigchld = reaper.spawn_sigchld_loop()?;

    let cgroups = CgroupAdapter::default();
    info!(
        namespace = %args.namespace,
        id = %args.id,
        cgroups = ?cgroups.mode(),
        "Starting mvirt-shim"
    );

    let (publisher, forwarder) = events::channel(&args.namespace, QUEUE_CAPACITY);
    let service = TaskService::new(
        &args.namespace,
        &reaper,
        Arc::new(CliRuntimeProvider::new(reaper.clone())),
        cgroups,
        publisher,
    );

    let listener = bootstrap::inherited_listener()?;
    let mut shutdown = service.shutdown_signal();
    let mut forced = service.shutdown_signal();
    let mut sigterm = signal(SignalKind::terminate())?;

    let server = Server::builder()
        .add_service(TaskServiceServer::new(TaskApiHandler::new(service, forwarder)))
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => {}
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        });

    tokio::select! {
        result = server => result?,
        _ = async {
            let _ = forced.wait_for(|stop| *stop).await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => warn!("Event streams still open, forcing shutdown"),
    }

    if let Ok(address) = bootstrap::read_address(&args.bundle()?) {
        let _ = std::fs::remove_file(bootstrap::socket_path(&address));
    }
    info!("mvirt-shim stopped");
    Ok(())
}
