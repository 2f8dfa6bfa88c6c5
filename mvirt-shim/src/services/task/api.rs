//! Task API Handler - gRPC implementation over the shim socket.

use super::{TaskService, VERSION};
use crate::container::{ExitInfo, Status as ProcessStatusKind};
use crate::proto::{
    CheckpointTaskRequest, CloseIoRequest, ConnectRequest, ConnectResponse, CreateTaskRequest,
    CreateTaskResponse, DeleteProcessRequest, DeleteRequest, DeleteResponse, Empty, Envelope,
    EventsRequest, ExecProcessRequest, KillRequest, PauseRequest, PidsRequest, PidsResponse,
    ProcessInfo, ProcessStatus, ResizePtyRequest, ResumeRequest, ShimInfoRequest,
    ShimInfoResponse, ShutdownRequest, StartRequest, StartResponse, StateRequest, StateResponse,
    StatsRequest, StatsResponse, UpdateTaskRequest, WaitRequest, WaitResponse,
    task_service_server::TaskService as TaskRpc,
};
use crate::services::events::{EventForwarder, timestamp};
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

/// Task API Handler for gRPC requests.
pub struct TaskApiHandler {
    service: Arc<TaskService>,
    events: EventForwarder,
}

impl TaskApiHandler {
    pub fn new(service: Arc<TaskService>, events: EventForwarder) -> Self {
        Self { service, events }
    }
}

fn process_status(status: ProcessStatusKind) -> ProcessStatus {
    match status {
        ProcessStatusKind::Unknown => ProcessStatus::Unknown,
        ProcessStatusKind::Created => ProcessStatus::Created,
        ProcessStatusKind::Running => ProcessStatus::Running,
        ProcessStatusKind::Stopped => ProcessStatus::Stopped,
        ProcessStatusKind::Paused => ProcessStatus::Paused,
        ProcessStatusKind::Pausing => ProcessStatus::Pausing,
    }
}

fn delete_response(exit: ExitInfo) -> DeleteResponse {
    DeleteResponse {
        pid: exit.pid as u32,
        exit_status: exit.status as u32,
        exited_at: Some(timestamp(exit.exited_at)),
    }
}

#[tonic::async_trait]
impl TaskRpc for TaskApiHandler {
    async fn state(&self, request: Request<StateRequest>) -> Result<Response<StateResponse>, Status> {
        let req = request.into_inner();
        let (state, bundle) = self.service.state(&req.id, &req.exec_id).await?;
        Ok(Response::new(StateResponse {
            id: req.id,
            exec_id: req.exec_id,
            bundle: bundle.display().to_string(),
            pid: state.pid as u32,
            status: process_status(state.status) as i32,
            stdin: state.stdio.stdin,
            stdout: state.stdio.stdout,
            stderr: state.stdio.stderr,
            terminal: state.stdio.terminal,
            exit_status: state.exit_status as u32,
            exited_at: state.exited_at.map(timestamp),
        }))
    }

    async fn create(
        &self,
        request: Request<CreateTaskRequest>,
    ) -> Result<Response<CreateTaskResponse>, Status> {
        let req = request.into_inner();
        info!("API: Create id={} bundle={}", req.id, req.bundle);
        let pid = self.service.create(req).await?;
        Ok(Response::new(CreateTaskResponse { pid: pid as u32 }))
    }

    async fn start(&self, request: Request<StartRequest>) -> Result<Response<StartResponse>, Status> {
        let req = request.into_inner();
        info!("API: Start id={} exec_id={}", req.id, req.exec_id);
        let pid = self.service.start(&req.id, &req.exec_id).await?;
        Ok(Response::new(StartResponse { pid: pid as u32 }))
    }

    async fn delete(&self, request: Request<DeleteRequest>) -> Result<Response<DeleteResponse>, Status> {
        let req = request.into_inner();
        info!("API: Delete id={} exec_id={}", req.id, req.exec_id);
        let exit = self.service.delete(&req.id, &req.exec_id).await?;
        Ok(Response::new(delete_response(exit)))
    }

    async fn delete_process(
        &self,
        request: Request<DeleteProcessRequest>,
    ) -> Result<Response<DeleteResponse>, Status> {
        let req = request.into_inner();
        info!("API: DeleteProcess id={} exec_id={}", req.id, req.exec_id);
        let exit = self.service.delete_process(&req.id, &req.exec_id).await?;
        Ok(Response::new(delete_response(exit)))
    }

    async fn pids(&self, request: Request<PidsRequest>) -> Result<Response<PidsResponse>, Status> {
        let req = request.into_inner();
        let processes = self
            .service
            .pids(&req.id)
            .await?
            .into_iter()
            .map(|info| ProcessInfo {
                pid: info.pid as u32,
                exec_id: info.exec_id.unwrap_or_default(),
            })
            .collect();
        Ok(Response::new(PidsResponse { processes }))
    }

    async fn pause(&self, request: Request<PauseRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        info!("API: Pause id={}", req.id);
        self.service.pause(&req.id).await?;
        Ok(Response::new(Empty {}))
    }

    async fn resume(&self, request: Request<ResumeRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        info!("API: Resume id={}", req.id);
        self.service.resume(&req.id).await?;
        Ok(Response::new(Empty {}))
    }

    async fn checkpoint(
        &self,
        request: Request<CheckpointTaskRequest>,
    ) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        info!("API: Checkpoint id={} path={}", req.id, req.path);
        self.service.checkpoint(&req.id, &req.path, req.exit).await?;
        Ok(Response::new(Empty {}))
    }

    async fn kill(&self, request: Request<KillRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        self.service
            .kill(&req.id, &req.exec_id, req.signal, req.all)
            .await?;
        Ok(Response::new(Empty {}))
    }

    async fn exec(&self, request: Request<ExecProcessRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        info!("API: Exec id={} exec_id={}", req.id, req.exec_id);
        self.service.exec(req).await?;
        Ok(Response::new(Empty {}))
    }

    async fn resize_pty(&self, request: Request<ResizePtyRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        self.service
            .resize_pty(&req.id, &req.exec_id, req.width, req.height)
            .await?;
        Ok(Response::new(Empty {}))
    }

    async fn close_io(&self, request: Request<CloseIoRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        if req.stdin {
            self.service.close_io(&req.id, &req.exec_id).await?;
        }
        Ok(Response::new(Empty {}))
    }

    async fn update(&self, request: Request<UpdateTaskRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        info!("API: Update id={}", req.id);
        self.service.update(&req.id, &req.resources).await?;
        Ok(Response::new(Empty {}))
    }

    async fn wait(&self, request: Request<WaitRequest>) -> Result<Response<WaitResponse>, Status> {
        let req = request.into_inner();
        debug!("API: Wait id={} exec_id={}", req.id, req.exec_id);
        let exit = self.service.wait(&req.id, &req.exec_id).await?;
        Ok(Response::new(WaitResponse {
            exit_status: exit.status as u32,
            exited_at: Some(timestamp(exit.exited_at)),
        }))
    }

    async fn stats(&self, request: Request<StatsRequest>) -> Result<Response<StatsResponse>, Status> {
        let req = request.into_inner();
        let stats = self.service.stats(&req.id).await?;
        Ok(Response::new(StatsResponse { stats }))
    }

    async fn connect_task(
        &self,
        request: Request<ConnectRequest>,
    ) -> Result<Response<ConnectResponse>, Status> {
        let req = request.into_inner();
        let (shim_pid, task_pid) = self.service.connect(&req.id);
        Ok(Response::new(ConnectResponse {
            shim_pid,
            task_pid,
            version: VERSION.to_string(),
        }))
    }

    async fn shim_info(
        &self,
        _request: Request<ShimInfoRequest>,
    ) -> Result<Response<ShimInfoResponse>, Status> {
        Ok(Response::new(ShimInfoResponse {
            shim_pid: std::process::id(),
            version: VERSION.to_string(),
        }))
    }

    async fn shutdown(&self, request: Request<ShutdownRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        info!("API: Shutdown id={} now={}", req.id, req.now);
        self.service.shutdown().await;
        Ok(Response::new(Empty {}))
    }

    type EventsStream = ReceiverStream<Result<Envelope, Status>>;

    async fn events(
        &self,
        _request: Request<EventsRequest>,
    ) -> Result<Response<Self::EventsStream>, Status> {
        info!("API: Events subscription");
        Ok(Response::new(self.events.subscribe()))
    }
}
