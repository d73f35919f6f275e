pub mod v1 {
    tonic::include_proto!("arbor.v1");
}

pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("descriptor");

/// Metadata key carrying the current leader's address on `UNAVAILABLE` replies.
pub const LEADER_ADDR_METADATA: &str = "arbor-leader-addr";
