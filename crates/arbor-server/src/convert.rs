use arbor_proto::LEADER_ADDR_METADATA;
use tonic::metadata::MetadataValue;
use tonic::Status;

use crate::node::NodeError;

/// Maps a node error onto a gRPC status. Not-leader replies always carry the
/// leader-address metadata key; its value is empty when the leader is unknown.
pub fn node_to_status(err: NodeError) -> Status {
    match &err {
        NodeError::NotLeader { leader } => {
            let mut status = Status::unavailable(err.to_string());
            let addr = leader.as_deref().unwrap_or("");
            if let Ok(val) = MetadataValue::try_from(addr) {
                status.metadata_mut().insert(LEADER_ADDR_METADATA, val);
            }
            status
        }
        NodeError::UnknownOpCode(_) => Status::unimplemented(err.to_string()),
        NodeError::InvalidRequest(_) => Status::invalid_argument(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_leader_carries_hint() {
        let status = node_to_status(NodeError::NotLeader {
            leader: Some("10.0.0.2:5254".into()),
        });
        assert_eq!(status.code(), tonic::Code::Unavailable);
        let hint = status.metadata().get(LEADER_ADDR_METADATA).unwrap();
        assert_eq!(hint.to_str().unwrap(), "10.0.0.2:5254");
    }

    #[test]
    fn test_unknown_leader_has_empty_hint() {
        let status = node_to_status(NodeError::NotLeader { leader: None });
        let hint = status.metadata().get(LEADER_ADDR_METADATA).unwrap();
        assert_eq!(hint.to_str().unwrap(), "");
    }

    #[test]
    fn test_invalid_request() {
        let status = node_to_status(NodeError::InvalidRequest("session 4 expired".into()));
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(status.message().contains("session 4 expired"));
    }
}
