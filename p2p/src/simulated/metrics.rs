use crate::Channel;
use ocr_utils::OracleId;
use prometheus_client::encoding::EncodeLabelSet;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Message {
    pub origin: OracleId,
    pub recipient: OracleId,
    pub channel: Channel,
}

impl Message {
    pub fn new(origin: OracleId, recipient: OracleId, channel: Channel) -> Self {
        Self {
            origin,
            recipient,
            channel,
        }
    }
}
