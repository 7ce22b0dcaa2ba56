use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

/// An unbounded async FIFO: any number of concurrent producers, any number
/// of concurrent waiting consumers, and a terminal `shutdown()` that wakes
/// every outstanding waiter with `None`. At most one of `items`/`waiters` is
/// non-empty at any time.
pub struct InputQueue<T> {
	state: Mutex<State<T>>,
}

struct State<T> {
	items: VecDeque<T>,
	waiters: VecDeque<(u64, oneshot::Sender<Option<T>>)>,
	next_waiter_id: u64,
	closed: bool,
}

impl<T> Default for InputQueue<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T> InputQueue<T> {
	pub fn new() -> Self {
		Self {
			state: Mutex::new(State {
				items: VecDeque::new(),
				waiters: VecDeque::new(),
				next_waiter_id: 0,
				closed: false,
			}),
		}
	}

	/// Enqueues `item`. Returns `false` (and drops `item`) if the queue has
	/// already been shut down.
	pub fn enqueue(&self, item: T) -> bool {
		let mut state = self.state.lock().unwrap();
		if state.closed {
			return false;
		}
		let mut item = item;
		// A waiter may have been dropped (its dequeue() future was
		// cancelled); try the next one instead of losing the item.
		while let Some((_id, waiter)) = state.waiters.pop_front() {
			match waiter.send(Some(item)) {
				Ok(()) => return true,
				Err(Some(returned)) => item = returned,
				Err(None) => unreachable!("we always send Some(item)"),
			}
		}
		state.items.push_back(item);
		true
	}

	/// Dequeues the next item, waiting up to `timeout` (or forever if
	/// `None`). Resolves to `None` immediately if the queue is closed and
	/// drained, or once `timeout` elapses without an item arriving — in the
	/// timeout case the parked waiter is also removed from `waiters`, not
	/// just left for a future `enqueue` to discover is disconnected.
	pub async fn dequeue(&self, timeout: Option<Duration>) -> Option<T> {
		let (id, rx) = {
			let mut state = self.state.lock().unwrap();
			if let Some(item) = state.items.pop_front() {
				return Some(item);
			}
			if state.closed {
				return None;
			}
			let id = state.next_waiter_id;
			state.next_waiter_id += 1;
			let (tx, rx) = oneshot::channel();
			state.waiters.push_back((id, tx));
			(id, rx)
		};

		match timeout {
			None => rx.await.unwrap_or(None),
			Some(duration) => match tokio::time::timeout(duration, rx).await {
				Ok(result) => result.unwrap_or(None),
				Err(_elapsed) => {
					let mut state = self.state.lock().unwrap();
					state.waiters.retain(|(waiter_id, _)| *waiter_id != id);
					None
				},
			},
		}
	}

	/// Marks the queue closed: every future `enqueue` is dropped, and every
	/// currently-parked waiter resolves with `None`, in the order they
	/// parked. Items already sitting in `items` remain readable by
	/// `dequeue` (drain semantics).
	pub fn shutdown(&self) {
		let mut state = self.state.lock().unwrap();
		state.closed = true;
		while let Some((_id, waiter)) = state.waiters.pop_front() {
			let _ = waiter.send(None);
		}
	}

	pub fn is_closed(&self) -> bool {
		self.state.lock().unwrap().closed
	}

	/// Drains any remaining items, handing each to `f` (typically "close
	/// this channel"). Idempotent: a second call sees an empty queue.
	pub fn dispose(&self, mut f: impl FnMut(T)) {
		let mut items = {
			let mut state = self.state.lock().unwrap();
			std::mem::take(&mut state.items)
		};
		for item in items.drain(..) {
			f(item);
		}
	}

	pub fn len(&self) -> usize {
		self.state.lock().unwrap().items.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	#[cfg(test)]
	fn waiter_count(&self) -> usize {
		self.state.lock().unwrap().waiters.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;
	use std::time::Duration;

	#[tokio::test]
	async fn enqueue_then_dequeue_is_fifo() {
		let q: InputQueue<i32> = InputQueue::new();
		assert!(q.enqueue(1));
		assert!(q.enqueue(2));
		assert_eq!(q.dequeue(None).await, Some(1));
		assert_eq!(q.dequeue(None).await, Some(2));
	}

	#[tokio::test]
	async fn waiter_parked_before_enqueue_gets_item_directly() {
		let q = Arc::new(InputQueue::<i32>::new());
		let q2 = q.clone();
		let consumer = tokio::spawn(async move { q2.dequeue(None).await });
		// give the consumer a chance to park as a waiter
		tokio::task::yield_now().await;
		tokio::time::sleep(Duration::from_millis(10)).await;
		assert!(q.enqueue(42));
		assert_eq!(consumer.await.unwrap(), Some(42));
		assert!(q.is_empty());
	}

	#[tokio::test]
	async fn dequeue_times_out_with_none() {
		let q: InputQueue<i32> = InputQueue::new();
		let result = q.dequeue(Some(Duration::from_millis(20))).await;
		assert_eq!(result, None);
	}

	#[tokio::test]
	async fn timed_out_dequeue_removes_its_own_waiter() {
		let q: InputQueue<i32> = InputQueue::new();
		for _ in 0..5 {
			assert_eq!(q.dequeue(Some(Duration::from_millis(5))).await, None);
		}
		assert_eq!(q.waiter_count(), 0);
	}

	#[tokio::test]
	async fn shutdown_wakes_waiters_and_rejects_future_enqueues() {
		let q = Arc::new(InputQueue::<i32>::new());
		let q2 = q.clone();
		let consumer = tokio::spawn(async move { q2.dequeue(None).await });
		tokio::time::sleep(Duration::from_millis(10)).await;
		q.shutdown();
		assert_eq!(consumer.await.unwrap(), None);
		assert!(!q.enqueue(1));
	}

	#[tokio::test]
	async fn shutdown_preserves_drain_semantics_for_existing_items() {
		let q: InputQueue<i32> = InputQueue::new();
		q.enqueue(1);
		q.shutdown();
		// already-queued items are still readable after shutdown
		assert_eq!(q.dequeue(None).await, Some(1));
		assert_eq!(q.dequeue(None).await, None);
	}

	#[tokio::test]
	async fn dispose_closes_remaining_items() {
		let q: InputQueue<i32> = InputQueue::new();
		q.enqueue(1);
		q.enqueue(2);
		let mut closed = Vec::new();
		q.dispose(|item| closed.push(item));
		assert_eq!(closed, vec![1, 2]);
		assert!(q.is_empty());
	}
}
