use std::sync::Arc;

use arbor_proto::v1::{client_service_server::ClientService, CallRequest, CallResponse};
use tonic::{Request, Response, Status};

use crate::convert::node_to_status;
use crate::node::ServerNode;

pub struct ClientServiceImpl {
    node: Arc<ServerNode>,
}

impl ClientServiceImpl {
    pub fn new(node: Arc<ServerNode>) -> Self {
        ClientServiceImpl { node }
    }
}

#[tonic::async_trait]
impl ClientService for ClientServiceImpl {
    async fn call(&self, request: Request<CallRequest>) -> Result<Response<CallResponse>, Status> {
        let req = request.into_inner();
        tracing::trace!(op_code = req.op_code, bytes = req.payload.len(), "client call");
        let payload = self
            .node
            .handle(req.op_code, &req.payload)
            .map_err(node_to_status)?;
        Ok(Response::new(CallResponse { payload }))
    }
}
