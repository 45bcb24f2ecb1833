use anyhow::{anyhow, Context, Result};
use ethers::types::{H160, H256, U256, U64};
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use serde::Deserialize;

/// The subset of a block header the relayer works with, for both chains.
/// Web3Q headers additionally carry the consensus commit; Ethereum headers
/// never do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainHeader {
	pub parent_hash: H256,
	pub state_root: H256,
	pub transactions_root: H256,
	pub receipts_root: H256,
	pub number: u64,
	pub timestamp: u64,
	pub base_fee_per_gas: U256,
	pub commit: Option<Commit>,
}

/// Tendermint-style commit sealing a Web3Q header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
	pub height: u64,
	pub round: u64,
	pub block_id: H256,
	pub signatures: Vec<CommitSig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSig {
	pub validator: H160,
	pub signature: Vec<u8>,
}

impl Encodable for CommitSig {
	fn rlp_append(&self, s: &mut RlpStream) {
		s.begin_list(2);
		s.append(&self.validator);
		s.append(&self.signature);
	}
}

impl Decodable for CommitSig {
	fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
		Ok(CommitSig { validator: rlp.val_at(0)?, signature: rlp.val_at(1)? })
	}
}

impl Encodable for Commit {
	fn rlp_append(&self, s: &mut RlpStream) {
		s.begin_list(4);
		s.append(&self.height);
		s.append(&self.round);
		s.append(&self.block_id);
		s.append_list(&self.signatures);
	}
}

impl Decodable for Commit {
	fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
		Ok(Commit {
			height: rlp.val_at(0)?,
			round: rlp.val_at(1)?,
			block_id: rlp.val_at(2)?,
			signatures: rlp.list_at(3)?,
		})
	}
}

// The commit is the optional trailing list item. Its presence is encoded in
// the list length, the same scheme go-ethereum uses for optional header
// fields.
const HEADER_BASE_FIELDS: usize = 7;

impl Encodable for ChainHeader {
	fn rlp_append(&self, s: &mut RlpStream) {
		s.begin_list(HEADER_BASE_FIELDS + usize::from(self.commit.is_some()));
		s.append(&self.parent_hash);
		s.append(&self.state_root);
		s.append(&self.transactions_root);
		s.append(&self.receipts_root);
		s.append(&self.number);
		s.append(&self.timestamp);
		s.append(&self.base_fee_per_gas);
		if let Some(commit) = &self.commit {
			s.append(commit);
		}
	}
}

impl Decodable for ChainHeader {
	fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
		let commit = match rlp.item_count()? {
			n if n == HEADER_BASE_FIELDS => None,
			n if n == HEADER_BASE_FIELDS + 1 => Some(rlp.val_at(HEADER_BASE_FIELDS)?),
			_ => return Err(DecoderError::RlpIncorrectListLen),
		};
		Ok(ChainHeader {
			parent_hash: rlp.val_at(0)?,
			state_root: rlp.val_at(1)?,
			transactions_root: rlp.val_at(2)?,
			receipts_root: rlp.val_at(3)?,
			number: rlp.val_at(4)?,
			timestamp: rlp.val_at(5)?,
			base_fee_per_gas: rlp.val_at(6)?,
			commit,
		})
	}
}

/// Splits a commit-bearing header into the two byte strings the light
/// client's `submitHeader` takes: the header with the commit cleared, and
/// the commit on its own.
pub fn pack_epoch_header(header: &ChainHeader) -> Result<(Vec<u8>, Vec<u8>)> {
	let commit = header
		.commit
		.as_ref()
		.ok_or_else(|| anyhow!("header {} carries no commit", header.number))?;

	let mut bare = header.clone();
	bare.commit = None;

	Ok((rlp::encode(&bare).to_vec(), rlp::encode(commit).to_vec()))
}

// ======= RPC representation =======

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCommitSig {
	validator: H160,
	signature: ethers::types::Bytes,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCommit {
	height: U64,
	round: U64,
	block_id: H256,
	signatures: Vec<RawCommitSig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHeader {
	parent_hash: H256,
	state_root: H256,
	transactions_root: H256,
	receipts_root: H256,
	number: U64,
	timestamp: U64,
	base_fee_per_gas: Option<U256>,
	commit: Option<RawCommit>,
}

fn parse_raw_header(raw: serde_json::Value) -> Result<(ChainHeader, Option<Commit>)> {
	let raw: RawHeader =
		serde_json::from_value(raw).context("Failed to deserialize block header from RPC")?;
	let commit = raw.commit.map(|c| Commit {
		height: c.height.as_u64(),
		round: c.round.as_u64(),
		block_id: c.block_id,
		signatures: c
			.signatures
			.into_iter()
			.map(|s| CommitSig { validator: s.validator, signature: s.signature.to_vec() })
			.collect(),
	});
	Ok((
		ChainHeader {
			parent_hash: raw.parent_hash,
			state_root: raw.state_root,
			transactions_root: raw.transactions_root,
			receipts_root: raw.receipts_root,
			number: raw.number.as_u64(),
			timestamp: raw.timestamp.as_u64(),
			base_fee_per_gas: raw.base_fee_per_gas.unwrap_or_default(),
			commit: None,
		},
		commit,
	))
}

/// How a chain's headers are read off the wire and turned into light-client
/// submissions. One relayer implementation serves both chains; the codec is
/// the only part that differs.
pub trait HeaderCodec: Send + Sync + 'static {
	/// Parses the raw `eth_getBlockByNumber`/`newHeads` JSON.
	fn decode_block(&self, raw: serde_json::Value) -> Result<ChainHeader>;

	/// Produces the `(header_without_commit, commit)` pair `submitHeader`
	/// expects. Fails for chains whose headers are never submitted.
	fn pack_for_submission(&self, header: &ChainHeader) -> Result<(Vec<u8>, Vec<u8>)>;
}

/// Codec for the chain whose headers get attested on the counterparty light
/// client. Headers must carry their commit.
#[derive(Debug, Default, Clone, Copy)]
pub struct EpochHeaderCodec;

impl HeaderCodec for EpochHeaderCodec {
	fn decode_block(&self, raw: serde_json::Value) -> Result<ChainHeader> {
		let (mut header, commit) = parse_raw_header(raw)?;
		header.commit =
			Some(commit.ok_or_else(|| {
				anyhow!("header {} is missing its consensus commit", header.number)
			})?);
		Ok(header)
	}

	fn pack_for_submission(&self, header: &ChainHeader) -> Result<(Vec<u8>, Vec<u8>)> {
		pack_epoch_header(header)
	}
}

/// Codec for plain EVM headers. Any commit field on the wire is ignored and
/// submission packing is not supported.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainHeaderCodec;

impl HeaderCodec for PlainHeaderCodec {
	fn decode_block(&self, raw: serde_json::Value) -> Result<ChainHeader> {
		let (header, _commit) = parse_raw_header(raw)?;
		Ok(header)
	}

	fn pack_for_submission(&self, _header: &ChainHeader) -> Result<(Vec<u8>, Vec<u8>)> {
		Err(anyhow!("headers of this chain are not submitted to a light client"))
	}
}

#[cfg(test)]
pub mod test_utils {
	use super::*;

	pub fn test_header(number: u64, commit: Option<Commit>) -> ChainHeader {
		ChainHeader {
			parent_hash: H256::repeat_byte(1),
			state_root: H256::repeat_byte(2),
			transactions_root: H256::repeat_byte(3),
			receipts_root: H256::repeat_byte(4),
			number,
			timestamp: 1_700_000_000 + number,
			base_fee_per_gas: U256::from(7u64),
			commit,
		}
	}

	pub fn test_commit(height: u64) -> Commit {
		Commit {
			height,
			round: 0,
			block_id: H256::repeat_byte(9),
			signatures: vec![CommitSig {
				validator: H160::repeat_byte(5),
				signature: vec![0xde, 0xad, 0xbe, 0xef],
			}],
		}
	}
}
