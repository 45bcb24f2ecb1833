//! Wires monitors, the scheduler and submit tasks into the two relaying
//! pipelines and registers everything with the coordinator.

use crate::{
	constants::{BLOCK_INTERVAL, DATA_CHANNEL_CAPACITY, RETRY_TIMES},
	contracts::{ContractCatalog, SEND_TOKEN_EVENT},
	coordinator::Coordinator,
	eth::header::ChainHeader,
	settings::{ChainConfig, Settings},
	task::{
		monitor::MonitorTask,
		pool::PoolTask,
		schedule::ScheduleTask,
		submit::{
			new_receive_token_on_wrapped_task, new_receive_token_task, new_submit_header_task,
		},
	},
};
use anyhow::{anyhow, Result};
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, watch};

/// Web3Q -> Ethereum: watch `SendToken` logs and new heads on Web3Q, attest
/// epoch headers on the Ethereum light client, then prove the logs to the
/// Ethereum bridge. Ordering between the two submissions is enforced by the
/// schedule task.
pub fn add_web3q_to_ethereum_pipeline(
	coordinator: &mut Coordinator,
	settings: &Settings,
	catalog: &Arc<ContractCatalog>,
	web3q: &ChainConfig,
	ethereum: &ChainConfig,
) -> Result<()> {
	let light_client_address = ethereum
		.light_client_address
		.ok_or_else(|| anyhow!("the ethereum chain needs a light client address configured"))?;

	let send_token_topic =
		catalog.event_topic(web3q.chain_id, web3q.bridge_address, SEND_TOKEN_EVENT)?;

	let monitor_event = Arc::new(MonitorTask::new_event(
		web3q.chain_id,
		web3q.bridge_address,
		SEND_TOKEN_EVENT,
		send_token_topic,
	));
	let monitor_header = Arc::new(MonitorTask::new_header(web3q.chain_id));

	let (log_tx, log_rx) = mpsc::channel(DATA_CHANNEL_CAPACITY);
	monitor_event.subscribe_data(log_tx)?;
	let (header_tx, header_rx) = mpsc::channel::<ChainHeader>(DATA_CHANNEL_CAPACITY);
	monitor_header.subscribe_data(header_tx)?;

	// Completion channel: the submit-header task publishes confirmed source
	// heights, the schedule gates receipt proofs on it.
	let confirmed_height_tx = Arc::new(watch::channel(0u64).0);

	let (submit_header_task, submit_header_in) = new_submit_header_task(
		web3q.chain_id,
		ethereum.chain_id,
		light_client_address,
		confirmed_height_tx.clone(),
		settings.confirmations,
		RETRY_TIMES,
		BLOCK_INTERVAL,
		coordinator.root_cancel(),
	);
	let (receive_token_task, receive_token_in) = new_receive_token_task(
		web3q.chain_id,
		ethereum.chain_id,
		ethereum.bridge_address,
		RETRY_TIMES,
		BLOCK_INTERVAL,
	);

	let schedule = ScheduleTask::new(
		"schedule-w3q-to-eth".to_string(),
		web3q.chain_id,
		ethereum.chain_id,
		log_rx,
		header_rx,
		confirmed_height_tx.subscribe(),
		Duration::from_secs(settings.receive_token_delay_secs),
	);
	schedule.bind_submit_header(submit_header_in)?;
	schedule.bind_receive_token(receive_token_in)?;

	coordinator.add_task_into_task_pool(PoolTask::Schedule(schedule));
	coordinator.add_task_into_task_pool(PoolTask::Monitor(monitor_event));
	coordinator.add_task_into_task_pool(PoolTask::Monitor(monitor_header));
	coordinator.add_task_into_task_pool(PoolTask::Submit(submit_header_task));
	coordinator.add_task_into_task_pool(PoolTask::Submit(receive_token_task));
	Ok(())
}

/// Ethereum -> Web3Q: watch `SendToken` logs on the Ethereum bridge and
/// relay them to the Web3Q bridge once the source chain has buried them
/// under enough confirmations. No header attestation on this direction, so
/// the monitor feeds the submit task directly.
pub fn add_ethereum_to_web3q_pipeline(
	coordinator: &mut Coordinator,
	settings: &Settings,
	catalog: &Arc<ContractCatalog>,
	ethereum: &ChainConfig,
	web3q: &ChainConfig,
) -> Result<()> {
	let send_token_topic =
		catalog.event_topic(ethereum.chain_id, ethereum.bridge_address, SEND_TOKEN_EVENT)?;

	let monitor_event = Arc::new(MonitorTask::new_event(
		ethereum.chain_id,
		ethereum.bridge_address,
		SEND_TOKEN_EVENT,
		send_token_topic,
	));

	let (receive_token_task, receive_token_in) = new_receive_token_on_wrapped_task(
		ethereum.chain_id,
		web3q.chain_id,
		web3q.bridge_address,
		settings.confirmations,
		RETRY_TIMES,
		BLOCK_INTERVAL,
		coordinator.root_cancel(),
	);
	monitor_event.subscribe_data(receive_token_in)?;

	coordinator.add_task_into_task_pool(PoolTask::Monitor(monitor_event));
	coordinator.add_task_into_task_pool(PoolTask::Submit(receive_token_task));
	Ok(())
}
