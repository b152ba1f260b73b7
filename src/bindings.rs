//! Contract bindings for the destination bridge and the header syncers.

use ethers::contract::abigen;

use crate::types::Message;

abigen!(
    Bridge,
    r#"[
        struct Message { uint256 id; address from; uint256 srcChainId; uint256 destChainId; address owner; address to; address refundTo; uint256 value; uint256 fee; uint256 gasLimit; bytes data; string memo; }
        function processMessage(Message message, bytes proof) external payable
        function getMessageStatus(bytes32 msgHash) external view returns (uint8)
    ]"#
);

abigen!(
    TaikoL1,
    r#"[
        function getCrossChainBlockHash(uint256 blockId) external view returns (bytes32)
    ]"#
);

abigen!(
    TaikoL2,
    r#"[
        function latestSyncedL1Height() external view returns (uint256)
        function getCrossChainBlockHash(uint256 blockId) external view returns (bytes32)
    ]"#
);

impl From<&Message> for bridge::Message {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id,
            from: message.from,
            src_chain_id: message.src_chain_id.into(),
            dest_chain_id: message.dest_chain_id.into(),
            owner: message.owner,
            to: message.to,
            refund_to: message.refund_to,
            value: message.value,
            fee: message.fee,
            gas_limit: message.gas_limit,
            data: message.data.clone(),
            memo: message.memo.clone(),
        }
    }
}
