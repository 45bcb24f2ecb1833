/// Creates an interval that ticks every `period` without trying to catch up
/// on missed ticks. The first tick completes immediately unless
/// `yield_first` is false.
pub fn make_periodic_tick(period: std::time::Duration, yield_first: bool) -> tokio::time::Interval {
	let mut interval = tokio::time::interval_at(
		tokio::time::Instant::now() + if yield_first { std::time::Duration::ZERO } else { period },
		period,
	);
	interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
	interval
}

/// Receives from an optional channel, pending forever once the channel is
/// gone. Lets an event loop keep serving its other branches after one of its
/// upstreams has shut down.
pub async fn recv_or_pending<T>(receiver: &mut Option<tokio::sync::mpsc::Receiver<T>>) -> T {
	match receiver {
		Some(rx) => match rx.recv().await {
			Some(item) => item,
			None => {
				*receiver = None;
				std::future::pending().await
			},
		},
		None => std::future::pending().await,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test(start_paused = true)]
	async fn periodic_tick_ticks_immediately_when_asked() {
		let mut tick = make_periodic_tick(std::time::Duration::from_secs(5), true);
		tokio::time::timeout(std::time::Duration::from_millis(1), tick.tick())
			.await
			.expect("first tick should be immediate");
	}

	#[tokio::test]
	async fn recv_or_pending_yields_items_then_pends() {
		let (tx, rx) = tokio::sync::mpsc::channel(1);
		let mut rx = Some(rx);
		tx.send(1u32).await.unwrap();
		assert_eq!(recv_or_pending(&mut rx).await, 1);
		drop(tx);
		assert!(tokio::time::timeout(
			std::time::Duration::from_millis(10),
			recv_or_pending(&mut rx)
		)
		.await
		.is_err());
		assert!(rx.is_none());
	}
}
