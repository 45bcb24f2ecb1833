use anyhow::{anyhow, Result};
use ethers::types::{Log, H160, H256, U256};

/// A contract log as forwarded between monitor tasks and the scheduler.
/// Unlike the raw RPC type, every field the relayer depends on is present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
	pub address: H160,
	pub topics: Vec<H256>,
	pub data: Vec<u8>,
	/// Height of the source block the log was emitted in.
	pub block_number: u64,
	/// The transaction hash of the transaction that emitted this event
	pub tx_hash: H256,
	/// The index number of this particular log, in the list of logs emitted
	/// by the tx_hash
	pub log_index: U256,
}

impl std::fmt::Display for LogEvent {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(
			f,
			"LogEvent {{ address: {:?}, block: {}, tx_hash: {:#x}, log_index: {} }}",
			self.address, self.block_number, self.tx_hash, self.log_index
		)
	}
}

impl TryFrom<Log> for LogEvent {
	type Error = anyhow::Error;

	fn try_from(log: Log) -> Result<Self> {
		Ok(LogEvent {
			address: log.address,
			data: log.data.to_vec(),
			block_number: log
				.block_number
				.ok_or_else(|| anyhow!("Could not get block number from ETH log"))?
				.as_u64(),
			tx_hash: log
				.transaction_hash
				.ok_or_else(|| anyhow!("Could not get transaction hash from ETH log"))?,
			log_index: log
				.log_index
				.ok_or_else(|| anyhow!("Could not get log index from ETH log"))?,
			topics: log.topics,
		})
	}
}
