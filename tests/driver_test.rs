#[cfg(test)]
mod tests {
    #[cfg(feature = "coroutine")]
    use futures::executor::block_on;
    use promise_driver::{json, Backend, Error, Outcome, Promise, Resolver, Status, Value};
    #[cfg(feature = "coroutine")]
    use promise_driver::Config;
    #[cfg(feature = "coroutine")]
    use std::{thread, time::Duration};
    #[cfg(feature = "coroutine")]
    use tokio::runtime::Runtime;

    #[test]
    fn test_coroutine_needs_a_runtime() {
        match Promise::with_backend(Backend::Coroutine, |_| json!(1)) {
            Err(Error::DriverUnavailable { backend, .. }) => assert_eq!(backend, Backend::Coroutine),
            other => panic!("expected DriverUnavailable, got {:?}", other),
        }
    }

    #[cfg(feature = "coroutine")]
    #[test]
    fn test_coroutine_runs_on_the_runtime() {
        let runtime = Runtime::new().unwrap();
        let _guard = runtime.enter();
        let caller = thread::current().id();
        let promise = Promise::with_backend(Backend::Coroutine, move |_| {
            thread::sleep(Duration::from_millis(20));
            json!(thread::current().id() != caller)
        })
        .unwrap();
        assert_eq!(promise.value().unwrap(), json!(true));
    }

    #[cfg(feature = "coroutine")]
    #[test]
    fn test_coroutine_chain_and_future() {
        let runtime = Runtime::new().unwrap();
        let _guard = runtime.enter();
        let promise = Promise::with_backend(Backend::Coroutine, |resolver: Resolver| {
            resolver.resolve(json!("a"))
        })
        .unwrap()
        .then(|args| json!(format!("{}b", args)))
        .unwrap();
        let outcome = block_on(promise.settled()).unwrap();
        assert_eq!(outcome, Outcome::fulfilled(json!("ab")));
        assert_eq!(promise.backend(), Backend::Coroutine);
    }

    #[cfg(feature = "coroutine")]
    #[test]
    fn test_auto_picks_coroutine_inside_a_runtime() {
        let runtime = Runtime::new().unwrap();
        let _guard = runtime.enter();
        let promise = Promise::with_config(&Config::new(Backend::Auto), |_| json!(1)).unwrap();
        assert_eq!(promise.backend(), Backend::Coroutine);
        assert_eq!(promise.value().unwrap(), json!(1));
    }

    #[cfg(all(unix, feature = "fork"))]
    #[test]
    fn test_fork_fulfills_across_processes() {
        let parent = std::process::id();
        let promise = Promise::with_backend(Backend::Fork, move |_| {
            json!(std::process::id() != parent)
        })
        .unwrap();
        assert_eq!(promise.value().unwrap(), json!(true));
    }

    #[cfg(all(unix, feature = "fork"))]
    #[test]
    fn test_fork_transports_rejection_arguments() {
        let promise = Promise::with_backend(Backend::Fork, |resolver: Resolver| {
            resolver.reject_with(vec![json!(500), json!("server error")])
        })
        .unwrap();
        let outcome = promise.outcome().unwrap();
        assert_eq!(outcome.status(), Status::Rejected);
        assert_eq!(outcome.args().to_vec(), vec![json!(500), json!("server error")]);
    }

    #[cfg(all(unix, feature = "fork"))]
    #[test]
    fn test_fork_child_panic_is_a_rejection() {
        let promise = Promise::with_backend(Backend::Fork, |_| -> Value { panic!("child failed") })
            .unwrap();
        assert_eq!(promise.outcome().unwrap(), Outcome::rejected(json!("child failed")));
    }

    #[cfg(all(unix, feature = "fork"))]
    #[test]
    fn test_fork_unexpected_exit_code() {
        let promise = Promise::with_backend(Backend::Fork, |_| -> Value { std::process::exit(3) })
            .unwrap();
        assert!(matches!(promise.outcome(), Err(Error::UnexpectedExitCode(3))));
    }

    #[cfg(all(unix, feature = "fork"))]
    #[test]
    fn test_fork_chain_forks_again() {
        let promise = Promise::with_backend(Backend::Fork, |_| json!(20))
            .unwrap()
            .then(|args| json!(args.first().as_i64().unwrap_or(0) + 1))
            .unwrap();
        assert_eq!(promise.backend(), Backend::Fork);
        assert_eq!(promise.value().unwrap(), json!(21));
    }
}
