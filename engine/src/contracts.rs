use anyhow::{anyhow, Context, Result};
use ethers::{
	abi::{Abi, Token},
	types::{H160, H256},
};
use std::collections::HashMap;

// Contract names referenced throughout the relayer.
pub const ETHEREUM_BRIDGE_CONTRACT: &str = "EthereumBridgeContract";
pub const WEB3Q_BRIDGE_CONTRACT: &str = "Web3qBridgeContract";
pub const LIGHT_CLIENT_CONTRACT: &str = "LightClientContract";

// Method names.
pub const SUBMIT_HEADER_FUNC: &str = "submitHeader";
pub const RECEIVE_FROM_WEB3Q_FUNC: &str = "receiveFromWeb3q";
pub const RECEIVE_FROM_ETH_FUNC: &str = "receiveFromEth";
pub const BLOCK_EXIST_FUNC: &str = "blockExist";
pub const GET_NEXT_EPOCH_HEIGHT_FUNC: &str = "getNextEpochHeight";

// Event names.
pub const SEND_TOKEN_EVENT: &str = "SendToken";

const LIGHT_CLIENT_ABI_JSON: &str = r#"[
	{
		"inputs": [
			{ "internalType": "uint256", "name": "height", "type": "uint256" },
			{ "internalType": "bytes", "name": "headerBytes", "type": "bytes" },
			{ "internalType": "bytes", "name": "commitBytes", "type": "bytes" },
			{ "internalType": "bool", "name": "lookByIndex", "type": "bool" }
		],
		"name": "submitHeader",
		"outputs": [],
		"stateMutability": "nonpayable",
		"type": "function"
	},
	{
		"inputs": [ { "internalType": "uint256", "name": "height", "type": "uint256" } ],
		"name": "blockExist",
		"outputs": [ { "internalType": "bool", "name": "", "type": "bool" } ],
		"stateMutability": "view",
		"type": "function"
	},
	{
		"inputs": [],
		"name": "getNextEpochHeight",
		"outputs": [ { "internalType": "uint256", "name": "", "type": "uint256" } ],
		"stateMutability": "view",
		"type": "function"
	}
]"#;

const ETHEREUM_BRIDGE_ABI_JSON: &str = r#"[
	{
		"inputs": [
			{ "internalType": "uint256", "name": "height", "type": "uint256" },
			{
				"components": [
					{ "internalType": "bytes", "name": "value", "type": "bytes" },
					{ "internalType": "bytes", "name": "proofPath", "type": "bytes" },
					{ "internalType": "bytes", "name": "hpKey", "type": "bytes" }
				],
				"internalType": "struct ILightClient.Proof",
				"name": "proof",
				"type": "tuple"
			},
			{ "internalType": "uint256", "name": "logIdx", "type": "uint256" }
		],
		"name": "receiveFromWeb3q",
		"outputs": [],
		"stateMutability": "nonpayable",
		"type": "function"
	},
	{
		"anonymous": false,
		"inputs": [
			{ "indexed": true, "internalType": "address", "name": "from", "type": "address" },
			{ "indexed": true, "internalType": "address", "name": "to", "type": "address" },
			{ "indexed": false, "internalType": "uint256", "name": "amount", "type": "uint256" }
		],
		"name": "SendToken",
		"type": "event"
	}
]"#;

const WEB3Q_BRIDGE_ABI_JSON: &str = r#"[
	{
		"inputs": [
			{ "internalType": "bytes32", "name": "txHash", "type": "bytes32" },
			{ "internalType": "uint256", "name": "logIdx", "type": "uint256" }
		],
		"name": "receiveFromEth",
		"outputs": [],
		"stateMutability": "nonpayable",
		"type": "function"
	},
	{
		"anonymous": false,
		"inputs": [
			{ "indexed": true, "internalType": "address", "name": "from", "type": "address" },
			{ "indexed": true, "internalType": "address", "name": "to", "type": "address" },
			{ "indexed": false, "internalType": "uint256", "name": "amount", "type": "uint256" }
		],
		"name": "SendToken",
		"type": "event"
	}
]"#;

#[derive(Debug, Clone)]
pub struct ContractInfo {
	pub address: H160,
	pub abi: Abi,
}

/// All contracts the relayer talks to, keyed by name and by
/// `(chain_id, address)`. Populated once during init and read-only after.
#[derive(Debug, Default)]
pub struct ContractCatalog {
	by_name: HashMap<&'static str, ContractInfo>,
	by_chain: HashMap<(u64, H160), Abi>,
}

impl ContractCatalog {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(
		&mut self,
		name: &'static str,
		chain_id: u64,
		address: H160,
		abi_json: &str,
	) -> Result<()> {
		let abi: Abi = serde_json::from_str(abi_json)
			.with_context(|| format!("Invalid embedded ABI for contract [{name}]"))?;
		if self.by_name.insert(name, ContractInfo { address, abi: abi.clone() }).is_some() {
			return Err(anyhow!("contract [{name}] registered twice"));
		}
		self.by_chain.insert((chain_id, address), abi);
		Ok(())
	}

	pub fn contract(&self, name: &str) -> Result<&ContractInfo> {
		self.by_name
			.get(name)
			.ok_or_else(|| anyhow!("contract [{name}] does not exist in the contract catalog"))
	}

	pub fn abi_for(&self, chain_id: u64, address: H160) -> Result<&Abi> {
		self.by_chain.get(&(chain_id, address)).ok_or_else(|| {
			anyhow!("no ABI registered for contract {address:?} on chain {chain_id}")
		})
	}

	/// topic0 of the given event, as used in log subscription filters.
	pub fn event_topic(&self, chain_id: u64, address: H160, event: &str) -> Result<H256> {
		Ok(self
			.abi_for(chain_id, address)?
			.event(event)
			.with_context(|| format!("event [{event}] not found on contract {address:?}"))?
			.signature())
	}

	/// ABI-packs a method call on the named contract.
	pub fn encode_call(&self, name: &str, method: &str, args: &[Token]) -> Result<Vec<u8>> {
		let contract = self.contract(name)?;
		contract
			.abi
			.function(method)
			.with_context(|| format!("method [{method}] not found on contract [{name}]"))?
			.encode_input(args)
			.with_context(|| format!("failed to ABI-pack [{name}].[{method}]"))
	}

	/// Decodes the raw return data of a method call on the named contract.
	pub fn decode_output(&self, name: &str, method: &str, data: &[u8]) -> Result<Vec<Token>> {
		let contract = self.contract(name)?;
		contract
			.abi
			.function(method)
			.with_context(|| format!("method [{method}] not found on contract [{name}]"))?
			.decode_output(data)
			.with_context(|| format!("failed to decode output of [{name}].[{method}]"))
	}
}

/// Builds the catalog for one bridge deployment: the bridge contract on each
/// chain plus the light client on the chain attesting the other side's
/// headers.
pub fn bridge_catalog(
	web3q_chain_id: u64,
	web3q_bridge: H160,
	ethereum_chain_id: u64,
	ethereum_bridge: H160,
	light_client: H160,
) -> Result<ContractCatalog> {
	let mut catalog = ContractCatalog::new();
	catalog.register(WEB3Q_BRIDGE_CONTRACT, web3q_chain_id, web3q_bridge, WEB3Q_BRIDGE_ABI_JSON)?;
	catalog.register(
		ETHEREUM_BRIDGE_CONTRACT,
		ethereum_chain_id,
		ethereum_bridge,
		ETHEREUM_BRIDGE_ABI_JSON,
	)?;
	catalog.register(
		LIGHT_CLIENT_CONTRACT,
		ethereum_chain_id,
		light_client,
		LIGHT_CLIENT_ABI_JSON,
	)?;
	Ok(catalog)
}

#[cfg(test)]
pub mod test_utils {
	use super::*;

	pub fn test_catalog() -> ContractCatalog {
		bridge_catalog(
			3333,
			H160::repeat_byte(0x33),
			5,
			H160::repeat_byte(0x05),
			H160::repeat_byte(0x1c),
		)
		.unwrap()
	}
}

#[cfg(test)]
mod tests {
	use super::{test_utils::test_catalog, *};
	use ethers::types::U256;

	#[test]
	fn embedded_abis_parse_and_register() {
		let catalog = test_catalog();
		assert_eq!(
			catalog.contract(LIGHT_CLIENT_CONTRACT).unwrap().address,
			H160::repeat_byte(0x1c)
		);
		assert!(catalog.contract("NoSuchContract").is_err());
	}

	#[test]
	fn send_token_topic_is_derivable_on_both_bridges() {
		let catalog = test_catalog();
		let w3q_topic = catalog.event_topic(3333, H160::repeat_byte(0x33), SEND_TOKEN_EVENT).unwrap();
		let eth_topic = catalog.event_topic(5, H160::repeat_byte(0x05), SEND_TOKEN_EVENT).unwrap();
		// Same signature, same topic.
		assert_eq!(w3q_topic, eth_topic);
		assert!(catalog.event_topic(3333, H160::repeat_byte(0x33), "NoSuchEvent").is_err());
	}

	#[test]
	fn submit_header_call_packs() {
		let catalog = test_catalog();
		let data = catalog
			.encode_call(
				LIGHT_CLIENT_CONTRACT,
				SUBMIT_HEADER_FUNC,
				&[
					Token::Uint(U256::from(100u64)),
					Token::Bytes(vec![1, 2, 3]),
					Token::Bytes(vec![4, 5, 6]),
					Token::Bool(false),
				],
			)
			.unwrap();
		// 4-byte selector followed by ABI-encoded arguments.
		assert!(data.len() > 4);
	}

	#[test]
	fn receive_from_web3q_packs_proof_tuple() {
		let catalog = test_catalog();
		let proof = Token::Tuple(vec![
			Token::Bytes(vec![0xaa]),
			Token::Bytes(vec![0xbb]),
			Token::Bytes(vec![0xcc]),
		]);
		assert!(catalog
			.encode_call(
				ETHEREUM_BRIDGE_CONTRACT,
				RECEIVE_FROM_WEB3Q_FUNC,
				&[Token::Uint(U256::from(100u64)), proof, Token::Uint(U256::from(2u64))],
			)
			.is_ok());
	}

	#[test]
	fn block_exist_output_decodes() {
		let catalog = test_catalog();
		let mut raw = vec![0u8; 32];
		raw[31] = 1;
		let tokens = catalog.decode_output(LIGHT_CLIENT_CONTRACT, BLOCK_EXIST_FUNC, &raw).unwrap();
		assert_eq!(tokens, vec![Token::Bool(true)]);
	}
}
