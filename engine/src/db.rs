use crate::eth::header::ChainHeader;
use anyhow::{Context, Result};
use rocksdb::{Options, DB};
use std::path::Path;
use tracing::warn;

/// Per-chain header cache. Key is the big-endian block number, value the
/// RLP-encoded header. The store is purely an optimisation: losing it (or
/// hitting a corrupt entry) falls back to fetching the header over RPC.
pub struct HeaderStore {
	db: DB,
	chain_id: u64,
}

impl HeaderStore {
	pub fn open(path: &Path, chain_id: u64) -> Result<Self> {
		let mut opts = Options::default();
		opts.create_if_missing(true);

		let db = DB::open(&opts, path)
			.map_err(anyhow::Error::msg)
			.with_context(|| format!("Failed to open header database at: {}", path.display()))?;

		Ok(HeaderStore { db, chain_id })
	}

	pub fn put_header(&self, header: &ChainHeader) -> Result<()> {
		self.db
			.put(header.number.to_be_bytes(), rlp::encode(header))
			.map_err(|e| anyhow::anyhow!("Failed to write header to database: {e}"))
	}

	/// Returns `None` on a miss *or* an undecodable entry; a bad entry is
	/// logged and treated like a miss so the caller falls back to RPC.
	pub fn get_header(&self, number: u64) -> Option<ChainHeader> {
		let raw = match self.db.get(number.to_be_bytes()) {
			Ok(Some(raw)) => raw,
			Ok(None) => return None,
			Err(e) => {
				warn!(chain_id = self.chain_id, number, "header db read failed: {e}");
				return None;
			},
		};
		match rlp::decode(&raw) {
			Ok(header) => Some(header),
			Err(e) => {
				warn!(chain_id = self.chain_id, number, "discarding undecodable header: {e}");
				None
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::eth::header::test_utils::{test_commit, test_header};

	#[test]
	fn headers_roundtrip_through_the_store() {
		let dir = tempfile::tempdir().unwrap();
		let store = HeaderStore::open(dir.path(), 3333).unwrap();

		let header = test_header(100, Some(test_commit(100)));
		store.put_header(&header).unwrap();

		assert_eq!(store.get_header(100), Some(header));
		assert_eq!(store.get_header(101), None);
	}

	#[test]
	fn corrupt_entry_reads_as_miss() {
		let dir = tempfile::tempdir().unwrap();
		let store = HeaderStore::open(dir.path(), 3333).unwrap();

		store.db.put(42u64.to_be_bytes(), b"not rlp").unwrap();
		assert_eq!(store.get_header(42), None);
	}
}
