#[cfg(test)]
mod tests {
    use futures::executor::block_on;
    #[cfg(feature = "cooperative")]
    use promise_driver::driver::cooperative;
    use promise_driver::{json, Args, Backend, Error, Outcome, Promise, Resolver, Status, Value};
    use std::sync::{mpsc, Arc, Mutex};
    use std::{thread, time::Duration};

    fn on<F, R>(backend: Backend, work: F) -> Promise
    where
        F: FnOnce(Resolver) -> R + Send + 'static,
        R: promise_driver::IntoFlow,
    {
        Promise::with_backend(backend, work).unwrap()
    }

    #[test]
    fn test_sync_chain() {
        let result = on(Backend::Sync, |resolver: Resolver| resolver.resolve(json!(2)))
            .then(|args| json!(args.first().as_i64().unwrap_or(0) + 1))
            .unwrap()
            .then(|args| json!(args.first().as_i64().unwrap_or(0) * 10))
            .unwrap();
        assert_eq!(result.value().unwrap(), json!(30));
    }

    #[test]
    fn test_rejection_skips_to_catch() {
        let visited = Arc::new(Mutex::new(Vec::new()));
        let (first, second) = (visited.clone(), visited.clone());
        let result = on(Backend::Sync, |_| -> Result<Value, String> { Err("broken".into()) })
            .then(move |_| first.lock().unwrap().push("then"))
            .unwrap()
            .catch(move |reason| {
                second.lock().unwrap().push("catch");
                json!(format!("caught {}", reason))
            })
            .unwrap();
        assert_eq!(result.value().unwrap(), json!("caught broken"));
        assert_eq!(*visited.lock().unwrap(), vec!["catch"]);
    }

    #[test]
    fn test_failing_handler_is_caught_downstream() {
        let result = on(Backend::Sync, |_| json!(1))
            .then(|_| -> Value { panic!("handler blew up") })
            .unwrap()
            .catch(|reason| reason.into_first())
            .unwrap();
        assert_eq!(result.value().unwrap(), json!("handler blew up"));
    }

    #[test]
    fn test_handler_returning_promise_is_flattened() {
        let result = on(Backend::Sync, |_| json!("outer"))
            .then(|args| {
                let inner = args.into_first();
                on(Backend::Sync, move |resolver: Resolver| {
                    resolver.resolve_with(vec![inner, json!("inner")])
                })
            })
            .unwrap();
        assert_eq!(
            result.outcome().unwrap(),
            Outcome::Fulfilled(Args::new(vec![json!("outer"), json!("inner")]))
        );
    }

    #[test]
    fn test_finally_runs_on_both_outcomes() {
        let runs = Arc::new(Mutex::new(0));
        for fail in [false, true] {
            let counter = runs.clone();
            let result = on(Backend::Sync, move |resolver: Resolver| {
                if fail {
                    resolver.reject(json!("no"))
                } else {
                    resolver.resolve(json!("yes"))
                }
            })
            .finally(move || *counter.lock().unwrap() += 1)
            .unwrap();
            let expected = if fail { Status::Rejected } else { Status::Fulfilled };
            assert_eq!(result.status().unwrap(), expected);
            let _ = result.outcome();
        }
        assert_eq!(*runs.lock().unwrap(), 2);
    }

    #[test]
    fn test_finally_with_rejecting_promise() {
        let result = on(Backend::Sync, |_| json!("kept"))
            .finally(|| on(Backend::Sync, |resolver: Resolver| resolver.reject(json!("cleanup"))))
            .unwrap();
        assert_eq!(result.outcome().unwrap(), Outcome::rejected(json!("cleanup")));
    }

    #[test]
    fn test_static_constructors() {
        assert_eq!(Promise::resolve(json!("v")).unwrap().value().unwrap(), json!("v"));
        let rejected = Promise::reject(json!("r")).unwrap();
        assert!(matches!(rejected.value(), Err(Error::Rejected(_))));
    }

    #[cfg(feature = "cooperative")]
    #[test]
    fn test_cooperative_chain_keeps_causal_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (a, b, c) = (log.clone(), log.clone(), log.clone());
        let head = on(Backend::Cooperative, move |_| {
            a.lock().unwrap().push("work");
            json!(1)
        });
        assert!(log.lock().unwrap().is_empty());
        let tail = head
            .then(move |_| b.lock().unwrap().push("then"))
            .unwrap()
            .finally(move || c.lock().unwrap().push("finally"))
            .unwrap();
        tail.outcome().unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["work", "then", "finally"]);
        assert_eq!(cooperative::pending(), 0);
    }

    #[cfg(feature = "cooperative")]
    #[test]
    fn test_cooperative_try_status_drives_the_queue() {
        let promise = on(Backend::Cooperative, |_| json!("ready"));
        let mut status = Status::Pending;
        for _ in 0..4 {
            status = promise.try_status().unwrap();
            if status != Status::Pending {
                break;
            }
        }
        assert_eq!(status, Status::Fulfilled);
        assert_eq!(promise.value().unwrap(), json!("ready"));
    }

    #[cfg(feature = "cooperative")]
    #[test]
    fn test_cooperative_promise_awaited() {
        let promise = on(Backend::Cooperative, |_| json!("awaited"));
        let outcome = block_on(async { promise.await }).unwrap();
        assert_eq!(outcome, Outcome::fulfilled(json!("awaited")));
    }

    #[test]
    fn test_escaped_resolver_settles_later() {
        let promise = on(Backend::Sync, |resolver: Resolver| {
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                resolver.reject(json!("late"));
            });
            json!("returned early")
        });
        assert_eq!(promise.outcome().unwrap(), Outcome::rejected(json!("late")));
    }

    #[cfg(feature = "cooperative")]
    #[test]
    fn test_clones_share_the_settle() {
        let promise = on(Backend::Cooperative, |_| json!(9));
        let clone = promise.clone();
        let task = thread::spawn(move || block_on(clone.settled()).map(Outcome::into_args));
        assert_eq!(promise.value().unwrap(), json!(9));
        let args = task.join().expect("The awaiting thread has panicked").unwrap();
        assert_eq!(args.first(), &json!(9));
    }

    #[test]
    fn test_resolver_settled_by_the_constructing_thread() {
        let (done_tx, done_rx) = mpsc::channel();
        thread::spawn(move || {
            let (tx, rx) = mpsc::channel();
            let promise = on(Backend::Sync, move |resolver: Resolver| {
                tx.send(resolver).unwrap();
            });
            assert_eq!(promise.try_status().unwrap(), Status::Pending);
            rx.recv().unwrap().resolve(json!("deferred"));
            done_tx.send(promise.value().unwrap()).unwrap();
        });
        let value = done_rx
            .recv_timeout(Duration::from_secs(3))
            .expect("construction or settle never returned");
        assert_eq!(value, json!("deferred"));
    }

    #[cfg(feature = "cooperative")]
    #[test]
    fn test_cooperative_resolver_settled_after_the_work_ran() {
        let (tx, rx) = mpsc::channel();
        let promise = on(Backend::Cooperative, move |resolver: Resolver| {
            tx.send(resolver).unwrap();
        });
        assert_eq!(promise.try_status().unwrap(), Status::Pending);
        rx.try_recv().unwrap().resolve(json!("deferred"));
        assert_eq!(promise.try_status().unwrap(), Status::Fulfilled);
        assert_eq!(promise.value().unwrap(), json!("deferred"));
    }
}
