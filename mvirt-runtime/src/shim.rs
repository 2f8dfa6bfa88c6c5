//! Connection to a running shim and the task calls bridged over it.

use crate::bundle::Bundle;
use crate::error::{Error, Result};
use crate::events::{EventBus, TaskEvent};
use hyper_util::rt::TokioIo;
use mvirt_shim::bootstrap::socket_path;
use mvirt_shim::proto::task_service_client::TaskServiceClient;
use mvirt_shim::proto::{
    CheckpointTaskRequest, CloseIoRequest, ConnectRequest, ConnectResponse, CreateTaskRequest,
    DeleteProcessRequest, DeleteRequest, DeleteResponse, EventsRequest, ExecProcessRequest,
    KillRequest, PauseRequest, PidsRequest, ProcessInfo, ResizePtyRequest, ResumeRequest,
    ShimInfoRequest, ShimInfoResponse, ShutdownRequest, StartRequest, StateRequest, StateResponse,
    StatsRequest, UpdateTaskRequest, WaitRequest, WaitResponse,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, info, warn};

/// Open a gRPC channel to a shim socket.
pub async fn connect_channel(address: &str, timeout: Duration) -> Result<Channel> {
    // The URI is a placeholder; the connector dials the socket.
    let endpoint = Endpoint::from_static("http://[::]:50051").connect_timeout(timeout);
    let path = socket_path(address);

    endpoint
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = path.clone();
            async move {
                debug!(path = %path.display(), "Dialing shim socket");
                let stream = UnixStream::connect(&path).await?;
                Ok::<_, std::io::Error>(TokioIo::new(stream))
            }
        }))
        .await
        .map_err(|source| Error::Connect {
            address: address.to_string(),
            source,
        })
}

/// One task's handle on the shim serving it.
///
/// Tasks that share a shim each hold their own connection.
#[derive(Debug)]
pub struct ShimInstance {
    bundle: Bundle,
    address: String,
    client: TaskServiceClient<Channel>,
    /// Set once the task was deleted on purpose, so the end of the event
    /// stream is not taken for a crash.
    closed: AtomicBool,
}

impl ShimInstance {
    pub async fn connect(bundle: Bundle, address: &str, timeout: Duration) -> Result<Self> {
        let channel = connect_channel(address, timeout).await?;
        info!(id = %bundle.id(), address = %address, "Connected to shim");
        Ok(Self {
            bundle,
            address: address.to_string(),
            client: TaskServiceClient::new(channel),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        self.bundle.id()
    }

    pub fn namespace(&self) -> &str {
        self.bundle.namespace()
    }

    pub fn bundle(&self) -> &Bundle {
        &self.bundle
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn client(&self) -> TaskServiceClient<Channel> {
        self.client.clone()
    }

    fn err(&self, op: &'static str) -> impl FnOnce(tonic::Status) -> Error + '_ {
        move |status| Error::rpc(op, self.id(), status)
    }

    /// Forward the shim's events into `bus` until the stream ends.
    pub async fn forward_events(&self, bus: &EventBus) {
        let mut stream = match self.client().events(EventsRequest {}).await {
            Ok(response) => response.into_inner(),
            Err(status) => {
                warn!(id = %self.id(), error = %status, "Failed to subscribe to shim events");
                return;
            }
        };
        loop {
            match stream.message().await {
                Ok(Some(envelope)) => {
                    if let Some(event) = TaskEvent::from_envelope(envelope) {
                        bus.publish(event);
                    }
                }
                Ok(None) => break,
                Err(status) => {
                    debug!(id = %self.id(), error = %status, "Shim event stream failed");
                    break;
                }
            }
        }
    }

    pub async fn create(&self, stdio: &TaskStdio, checkpoint: Option<&str>) -> Result<u32> {
        let request = CreateTaskRequest {
            id: self.id().to_string(),
            bundle: self.bundle.path().display().to_string(),
            terminal: stdio.terminal,
            stdin: stdio.stdin.clone(),
            stdout: stdio.stdout.clone(),
            stderr: stdio.stderr.clone(),
            checkpoint: checkpoint.unwrap_or_default().to_string(),
            parent_checkpoint: String::new(),
        };
        let response = self.client().create(request).await.map_err(self.err("create"))?;
        Ok(response.into_inner().pid)
    }

    pub async fn start(&self, exec_id: &str) -> Result<u32> {
        let request = StartRequest {
            id: self.id().to_string(),
            exec_id: exec_id.to_string(),
        };
        let response = self.client().start(request).await.map_err(self.err("start"))?;
        Ok(response.into_inner().pid)
    }

    pub async fn delete(&self, exec_id: &str) -> Result<DeleteResponse> {
        let request = DeleteRequest {
            id: self.id().to_string(),
            exec_id: exec_id.to_string(),
        };
        let response = self.client().delete(request).await.map_err(self.err("delete"))?;
        Ok(response.into_inner())
    }

    pub async fn delete_process(&self, exec_id: &str) -> Result<DeleteResponse> {
        let request = DeleteProcessRequest {
            id: self.id().to_string(),
            exec_id: exec_id.to_string(),
        };
        let response = self
            .client()
            .delete_process(request)
            .await
            .map_err(self.err("delete process"))?;
        Ok(response.into_inner())
    }

    pub async fn exec(&self, exec_id: &str, stdio: &TaskStdio, spec: Vec<u8>) -> Result<()> {
        let request = ExecProcessRequest {
            id: self.id().to_string(),
            exec_id: exec_id.to_string(),
            terminal: stdio.terminal,
            stdin: stdio.stdin.clone(),
            stdout: stdio.stdout.clone(),
            stderr: stdio.stderr.clone(),
            spec,
        };
        self.client().exec(request).await.map_err(self.err("exec"))?;
        Ok(())
    }

    pub async fn kill(&self, exec_id: &str, signal: u32, all: bool) -> Result<()> {
        let request = KillRequest {
            id: self.id().to_string(),
            exec_id: exec_id.to_string(),
            signal,
            all,
        };
        self.client().kill(request).await.map_err(self.err("kill"))?;
        Ok(())
    }

    pub async fn state(&self, exec_id: &str) -> Result<StateResponse> {
        let request = StateRequest {
            id: self.id().to_string(),
            exec_id: exec_id.to_string(),
        };
        let response = self.client().state(request).await.map_err(self.err("state"))?;
        Ok(response.into_inner())
    }

    pub async fn pids(&self) -> Result<Vec<ProcessInfo>> {
        let request = PidsRequest {
            id: self.id().to_string(),
        };
        let response = self.client().pids(request).await.map_err(self.err("pids"))?;
        Ok(response.into_inner().processes)
    }

    pub async fn pause(&self) -> Result<()> {
        let request = PauseRequest {
            id: self.id().to_string(),
        };
        self.client().pause(request).await.map_err(self.err("pause"))?;
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        let request = ResumeRequest {
            id: self.id().to_string(),
        };
        self.client().resume(request).await.map_err(self.err("resume"))?;
        Ok(())
    }

    pub async fn checkpoint(&self, path: &Path, exit: bool) -> Result<()> {
        let request = CheckpointTaskRequest {
            id: self.id().to_string(),
            path: path.display().to_string(),
            exit,
        };
        self.client()
            .checkpoint(request)
            .await
            .map_err(self.err("checkpoint"))?;
        Ok(())
    }

    pub async fn update(&self, resources: Vec<u8>, annotations: HashMap<String, String>) -> Result<()> {
        let request = UpdateTaskRequest {
            id: self.id().to_string(),
            resources,
            annotations,
        };
        self.client().update(request).await.map_err(self.err("update"))?;
        Ok(())
    }

    pub async fn wait(&self, exec_id: &str) -> Result<WaitResponse> {
        let request = WaitRequest {
            id: self.id().to_string(),
            exec_id: exec_id.to_string(),
        };
        let response = self.client().wait(request).await.map_err(self.err("wait"))?;
        Ok(response.into_inner())
    }

    pub async fn close_io(&self, exec_id: &str) -> Result<()> {
        let request = CloseIoRequest {
            id: self.id().to_string(),
            exec_id: exec_id.to_string(),
            stdin: true,
        };
        self.client().close_io(request).await.map_err(self.err("close io"))?;
        Ok(())
    }

    pub async fn resize_pty(&self, exec_id: &str, width: u32, height: u32) -> Result<()> {
        let request = ResizePtyRequest {
            id: self.id().to_string(),
            exec_id: exec_id.to_string(),
            width,
            height,
        };
        self.client()
            .resize_pty(request)
            .await
            .map_err(self.err("resize pty"))?;
        Ok(())
    }

    /// Serialized cgroup metrics of the task.
    pub async fn stats(&self) -> Result<Vec<u8>> {
        let request = StatsRequest {
            id: self.id().to_string(),
        };
        let response = self.client().stats(request).await.map_err(self.err("stats"))?;
        Ok(response.into_inner().stats)
    }

    /// Shim and task PID; doubles as a liveness probe.
    pub async fn connect_info(&self) -> Result<ConnectResponse> {
        let request = ConnectRequest {
            id: self.id().to_string(),
        };
        let response = self
            .client()
            .connect_task(request)
            .await
            .map_err(self.err("connect"))?;
        Ok(response.into_inner())
    }

    pub async fn shim_info(&self) -> Result<ShimInfoResponse> {
        let response = self
            .client()
            .shim_info(ShimInfoRequest {})
            .await
            .map_err(self.err("shim info"))?;
        Ok(response.into_inner())
    }

    /// Ask the shim to exit. It only does so once it hosts no containers.
    pub async fn shutdown(&self) -> Result<()> {
        let request = ShutdownRequest {
            id: self.id().to_string(),
            now: false,
        };
        match self.client().shutdown(request).await {
            Ok(_) => Ok(()),
            // The shim may close the connection while answering.
            Err(status) if status.code() == tonic::Code::Unavailable => Ok(()),
            Err(status) => Err(Error::rpc("shutdown", self.id(), status)),
        }
    }
}

/// Stdio of a task process as paths on the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskStdio {
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    pub terminal: bool,
}
