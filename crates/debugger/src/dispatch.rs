//! Fan-out of adapter events to subscribers.
//!
//! Every subscriber gets its own task fed by an unbounded queue. Events reach
//! each subscriber in the order they were dispatched, a slow subscriber only
//! delays itself, and a panicking subscriber is logged and keeps receiving.
//!
//! Observers instead run inline, on the dispatching task, before any
//! subscriber is queued the event. They must not block.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tokio::sync::mpsc;
use transport::Event;

/// Callback invoked for every event the adapter sends.
pub type EventHandler = Arc<dyn Fn(Event) + Send + Sync>;

#[derive(Clone)]
pub(crate) struct Dispatcher {
    observers: Arc<Vec<EventHandler>>,
    queues: Arc<Vec<mpsc::UnboundedSender<Event>>>,
}

impl Dispatcher {
    /// Start one delivery task per handler. Must be called inside a tokio
    /// runtime.
    pub(crate) fn spawn(observers: Vec<EventHandler>, handlers: Vec<EventHandler>) -> Self {
        let queues = handlers
            .into_iter()
            .enumerate()
            .map(|(subscriber, handler)| {
                let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
                tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        let name = event.event.clone();
                        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(event))) {
                            tracing::error!(
                                subscriber,
                                event = %name,
                                panic = panic_message(&*panic),
                                "event subscriber panicked"
                            );
                        }
                    }
                });
                tx
            })
            .collect();

        Self {
            observers: Arc::new(observers),
            queues: Arc::new(queues),
        }
    }

    pub(crate) fn dispatch(&self, event: Event) {
        for (observer, handler) in self.observers.iter().enumerate() {
            let copy = event.clone();
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(copy))) {
                tracing::error!(
                    observer,
                    event = %event.event,
                    panic = panic_message(&*panic),
                    "event observer panicked"
                );
            }
        }
        for queue in self.queues.iter() {
            // a closed queue means the runtime is shutting down
            let _ = queue.send(event.clone());
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn event(name: &str) -> Event {
        Event {
            seq: 0,
            event: name.to_string(),
            body: None,
        }
    }

    #[tokio::test]
    async fn events_arrive_in_order_after_a_panic() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = {
            let seen = Arc::clone(&seen);
            Arc::new(move |e: Event| {
                if e.event == "boom" {
                    panic!("subscriber failure");
                }
                seen.lock().unwrap().push(e.event);
            }) as EventHandler
        };

        let dispatcher = Dispatcher::spawn(Vec::new(), vec![recorder]);
        for name in ["a", "boom", "b", "c"] {
            dispatcher.dispatch(event(name));
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while seen.lock().unwrap().len() < 3 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn observers_run_before_dispatch_returns() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let observer = {
            let order = Arc::clone(&order);
            Arc::new(move |e: Event| {
                if e.event == "boom" {
                    panic!("observer failure");
                }
                order.lock().unwrap().push(format!("observer {}", e.event));
            }) as EventHandler
        };
        let subscriber = {
            let order = Arc::clone(&order);
            Arc::new(move |e: Event| order.lock().unwrap().push(format!("subscriber {}", e.event)))
                as EventHandler
        };

        let dispatcher = Dispatcher::spawn(vec![observer], vec![subscriber]);
        dispatcher.dispatch(event("boom"));
        dispatcher.dispatch(event("stopped"));
        // no await in between: the observer has already run
        assert_eq!(*order.lock().unwrap(), vec!["observer stopped"]);

        tokio::time::timeout(Duration::from_secs(5), async {
            while order.lock().unwrap().len() < 3 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            *order.lock().unwrap(),
            vec!["observer stopped", "subscriber boom", "subscriber stopped"]
        );
    }

    #[test]
    fn panic_messages() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(&*boxed), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*boxed), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(5_u8);
        assert_eq!(panic_message(&*boxed), "<non-string panic payload>");
    }
}
