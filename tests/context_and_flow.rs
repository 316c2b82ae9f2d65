//! Context propagation across remote calls, parallel merge behavior, and
//! settings-driven composition.

use futures::StreamExt;
use millrace::prelude::*;
use millrace::{absorb_response_metadata, outbound_metadata, ByteStream, Metadata};
use millrace::{key_strategy, Aspect, OrderingMode, ThreadSafety, HEADER_VERSION};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Echo invoker that records the headers it would have sent and replays a
/// cache status header from the "server".
struct EchoInvoker {
    seen: Arc<Mutex<Vec<Metadata>>>,
    respond_status: Option<&'static str>,
}

#[async_trait::async_trait]
impl RemoteInvoker for EchoInvoker {
    async fn invoke_unary(
        &self,
        _step_id: &str,
        request: Vec<u8>,
        ctx: &ContextHandle,
    ) -> Result<Vec<u8>, BoxError> {
        self.seen.lock().unwrap().push(outbound_metadata(ctx));
        if let Some(status) = self.respond_status {
            let mut response = Metadata::new();
            response.insert(millrace::HEADER_CACHE_STATUS, status);
            absorb_response_metadata(ctx, &response);
        }
        Ok(request)
    }

    async fn invoke_server_stream(
        &self,
        _step_id: &str,
        _request: Vec<u8>,
        _ctx: &ContextHandle,
    ) -> Result<ByteStream, BoxError> {
        unimplemented!("not exercised")
    }

    async fn invoke_client_stream(
        &self,
        _step_id: &str,
        _requests: ByteStream,
        _ctx: &ContextHandle,
    ) -> Result<Vec<u8>, BoxError> {
        unimplemented!("not exercised")
    }

    async fn invoke_bidi(
        &self,
        _step_id: &str,
        _requests: ByteStream,
        _ctx: &ContextHandle,
    ) -> Result<ByteStream, BoxError> {
        unimplemented!("not exercised")
    }
}

#[tokio::test]
async fn outbound_calls_carry_the_flow_context() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let echo = RemoteStep::unary::<String, String>(
        "echo",
        "svc.echo",
        Arc::new(EchoInvoker { seen: seen.clone(), respond_status: None }),
    );
    let pipeline = PipelineBuilder::new().step(echo).build().unwrap();

    let ctx = PipelineContext::new().with_version_tag("v5").with_replay_mode(true);
    let out: String = pipeline.run_unary_unary(Some(ctx), "hello".to_string()).await.unwrap();
    assert_eq!(out, "hello");

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].get(HEADER_VERSION), Some("v5"));
    assert_eq!(seen[0].get("x-pipeline-replay"), Some("true"));
}

#[tokio::test]
async fn response_cache_status_header_reaches_later_steps() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let echo = RemoteStep::unary::<String, String>(
        "echo",
        "svc.echo",
        Arc::new(EchoInvoker { seen: seen.clone(), respond_status: Some("HIT") }),
    );
    let observed = Arc::new(Mutex::new(None));
    let observed_step = observed.clone();
    let probe = Step::one_to_one_ctx("probe", move |s: String, ctx| {
        let observed = observed_step.clone();
        async move {
            *observed.lock().unwrap() = ctx.snapshot().cache_status();
            Ok::<_, BoxError>(s)
        }
    });
    let pipeline = PipelineBuilder::new().step(echo).step(probe).build().unwrap();

    let _: String = pipeline.run_unary_unary(None, "x".to_string()).await.unwrap();
    assert_eq!(*observed.lock().unwrap(), Some(CacheStatus::Hit));
}

#[tokio::test]
async fn relaxed_safe_steps_run_merged_but_ordered() {
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (current_step, peak_step) = (current.clone(), peak.clone());

    let slow = Step::one_to_one("slow", move |n: u32| {
        let current = current_step.clone();
        let peak = peak_step.clone();
        async move {
            let active = current.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            current.fetch_sub(1, Ordering::SeqCst);
            Ok::<_, BoxError>(n)
        }
    })
    .with_overrides(StepOverrides {
        ordering: Some(OrderingMode::Relaxed),
        thread_safety: Some(ThreadSafety::Safe),
        ..Default::default()
    });

    let settings = PipelineSettings::from_toml_str(
        r#"
        [pipeline]
        parallelism = "PARALLEL"
        max-concurrency = 4
        "#,
    )
    .unwrap();
    let pipeline = PipelineBuilder::new().step(slow).settings(settings).build().unwrap();

    let out = pipeline
        .run_stream_stream::<u32, u32, _>(None, futures::stream::iter(0..8_u32))
        .unwrap();
    let values: Vec<u32> = out.map(|r| r.unwrap()).collect().await;

    // Outputs stay ordered even though invocations overlap.
    assert_eq!(values, (0..8).collect::<Vec<_>>());
    assert!(peak.load(Ordering::SeqCst) > 1, "expected overlapping invocations");
    assert!(peak.load(Ordering::SeqCst) <= 4, "merge concurrency is capped");
}

#[tokio::test]
async fn settings_per_step_overrides_apply() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_step = calls.clone();
    let flaky = Step::one_to_one("flaky", move |_s: String| {
        let calls = calls_step.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<String, _>(Box::new(HttpError::new(500, "boom")) as BoxError)
        }
    });

    let settings = PipelineSettings::from_toml_str(
        r#"
        [pipeline.defaults]
        retry-limit = 5
        retry-wait-ms = 1

        [pipeline.step.flaky]
        retry-limit = 1
        "#,
    )
    .unwrap();
    let pipeline = PipelineBuilder::new()
        .step(flaky)
        .settings(settings)
        .pacer(millrace::Pacer::skip())
        .build()
        .unwrap();

    let err = pipeline.run_unary_unary::<String, String>(None, "x".to_string()).await.unwrap_err();
    assert!(matches!(err, PipelineError::Step { attempts: 1, .. }));
    // The per-step override beat the global retry-limit of 5.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cache_marked_step_without_backend_is_a_composition_error() {
    let echo = RemoteStep::unary::<String, String>(
        "echo",
        "svc.echo",
        Arc::new(EchoInvoker { seen: Arc::new(Mutex::new(Vec::new())), respond_status: None }),
    );
    let err = PipelineBuilder::new()
        .step(echo)
        .aspect(Aspect::after("cache"))
        .key_strategy(key_strategy(0, |s: &String| Some(s.clone())))
        .build()
        .unwrap_err();
    assert!(matches!(err, ConfigError::CacheBackendRequired { .. }));
}

#[tokio::test]
async fn one_to_many_fans_out_through_the_pipeline() {
    let explode = Step::one_to_many("explode", |s: String| async move {
        Ok::<_, BoxError>(futures::stream::iter(
            s.chars().map(|c| Ok::<_, BoxError>(c.to_string())).collect::<Vec<_>>(),
        ))
    });
    let upper = Step::one_to_one("upper", |s: String| async move {
        Ok::<_, BoxError>(s.to_uppercase())
    });
    let pipeline = PipelineBuilder::new().step(explode).step(upper).build().unwrap();

    let out = pipeline.run_unary_stream::<String, String>(None, "abc".to_string()).unwrap();
    let values: Vec<String> = out.map(|r| r.unwrap()).collect().await;
    assert_eq!(values, vec!["A", "B", "C"]);
}
