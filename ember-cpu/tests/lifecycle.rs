//! Device loss and recovery, auto-tuning and MoE routing on the host device.

mod test_helpers;

use ember::kernels::KernelKey;
use ember::moe::create_expert_execution_plan;
use ember::{
    Error, GpuContext, MatmulOptions, MoeConfig, MoeRouter, RuntimeConfig, TuneTarget,
};
use ember_cpu::HostBackend;

use test_helpers::{assert_close, default_context, pseudo_random};

#[tokio::test]
async fn loss_invalidates_until_recovered() {
    let ctx = default_context().await;
    let x = ctx.upload_f32(&[1.0, 2.0, 3.0, 4.0], "x").unwrap();
    let warm = ctx.run_residual_add(&x, &x, 4).await.unwrap();
    ctx.release_buffer(warm);
    assert_eq!(ctx.pipeline_count(), 1);

    ctx.device().unwrap().simulate_loss("driver reset");
    assert!(ctx.is_lost());
    assert_eq!(ctx.lost_reason().as_deref(), Some("driver reset"));
    assert!(matches!(ctx.capabilities(), Err(Error::DeviceNotInitialized)));
    assert_eq!(ctx.pipeline_count(), 0);

    let err = ctx.run_residual_add(&x, &x, 4).await.unwrap_err();
    assert!(matches!(err, Error::DeviceLost(ref r) if r == "driver reset"), "got {err:?}");
    let err = ctx.run_silu(&x, None, 4).await.unwrap_err();
    assert!(matches!(err, Error::DeviceLost(_)), "got {err:?}");
    // Buffers of the lost device are simply dropped.
    ctx.release_buffer(x);

    ctx.recover().await.unwrap();
    assert!(!ctx.is_lost());
    assert!(ctx.capabilities().is_ok());
    let x = ctx.upload_f32(&[1.0, 2.0, 3.0, 4.0], "x").unwrap();
    let sum = ctx.run_residual_add(&x, &x, 4).await.unwrap();
    assert_eq!(ctx.read_f32(&sum, 4).await.unwrap(), vec![2.0, 4.0, 6.0, 8.0]);
    assert_eq!(ctx.pipeline_count(), 1);
}

#[tokio::test]
async fn recover_without_loss_keeps_the_device() {
    let ctx = default_context().await;
    let before = ctx.device().unwrap();
    ctx.recover().await.unwrap();
    assert!(std::sync::Arc::ptr_eq(&before, &ctx.device().unwrap()));
}

#[tokio::test]
async fn autotune_records_results_and_keeps_outputs_correct() {
    let config = RuntimeConfig::from_json_str(
        r#"{"autotune": {"enabled": true, "iterations": 2, "candidates": [32, 64, 128]}}"#,
    )
    .unwrap();
    let ctx = GpuContext::create(HostBackend::new(), config).await.unwrap();
    let targets = [
        TuneTarget::Matmul { m: 8, n: 8, k: 8 },
        TuneTarget::RmsNorm { batch: 2, hidden: 128 },
        TuneTarget::Softmax { batch: 2, size: 300 },
        TuneTarget::Silu { size: 4096 },
        TuneTarget::ResidualAdd { size: 4096 },
    ];
    let results = ctx.autotune_kernels(&targets).await.unwrap();
    assert_eq!(results.len(), targets.len());
    assert_eq!(ctx.tuning().len(), targets.len());
    let limits = ctx.capabilities().unwrap().limits;
    for result in &results {
        assert!(limits.fits_workgroup(result.workgroup), "{result:?}");
    }
    assert_eq!(
        ctx.tuning().lookup(KernelKey::ResidualAdd, 4096),
        results.last().map(|r| r.workgroup)
    );
    assert_eq!(ctx.pool_stats().unwrap().active_buffers, 0);

    let a = pseudo_random(64, 1);
    let b = pseudo_random(64, 2);
    let (ab, bb) = (ctx.upload_f32(&a, "a").unwrap(), ctx.upload_f32(&b, "b").unwrap());
    let c = ctx
        .run_matmul(&ab, &bb, 8, 8, 8, MatmulOptions { prefer_f16: Some(false), ..Default::default() })
        .await
        .unwrap();
    let got = ctx.read_f32(&c, 64).await.unwrap();
    let expected = test_helpers::matmul_reference(&a, &b, 8, 8, 8);
    assert_close(&got, &expected, 1e-5);
}

fn router() -> MoeRouter {
    let mut router = MoeRouter::new(MoeConfig {
        num_experts: 4,
        top_k: 2,
        hidden_size: 8,
        normalize_weights: true,
    })
    .unwrap();
    router.load_gate_weights(pseudo_random(8 * 4, 21)).unwrap();
    router
}

#[tokio::test]
async fn gpu_routing_matches_host_routing() {
    let ctx = default_context().await;
    let hidden = pseudo_random(5 * 8, 22);

    let mut host = router();
    let mut gpu = router();
    let expected = host.route(&hidden, 5).unwrap();
    let got = gpu.route_gpu(&ctx, &hidden, 5).await.unwrap();

    for (g, e) in got.iter().zip(&expected) {
        assert_eq!(g.experts, e.experts);
        assert_close(&g.weights, &e.weights, 1e-5);
        assert_close(&g.logits, &e.logits, 1e-5);
    }
    assert_eq!(host.stats(), gpu.stats());
    assert_eq!(gpu.stats().total_tokens, 5);
    assert_eq!(gpu.stats().expert_counts.iter().sum::<u64>(), 10);

    let plan = create_expert_execution_plan(&got, 4).unwrap();
    let routed: usize = plan.values().map(|a| a.token_indices.len()).sum();
    assert_eq!(routed, 10);
    assert_eq!(ctx.pool_stats().unwrap().active_buffers, 0);
}

#[tokio::test]
async fn auto_routing_falls_back_to_host() {
    let hidden = pseudo_random(3 * 8, 23);
    let expected = router().route(&hidden, 3).unwrap();

    let mut r = router();
    let without = r
        .route_auto(None::<&GpuContext<HostBackend>>, &hidden, 3)
        .await
        .unwrap();
    assert_eq!(without, expected);

    let ctx = default_context().await;
    ctx.device().unwrap().simulate_loss("gone");
    let after_loss = r.route_auto(Some(&ctx), &hidden, 3).await.unwrap();
    assert_eq!(after_loss, expected);
    assert_eq!(r.stats().total_tokens, 6);
}

#[tokio::test]
async fn gpu_routing_on_lost_device_is_unavailable() {
    let hidden = pseudo_random(3 * 8, 29);
    let ctx = default_context().await;
    ctx.device().unwrap().simulate_loss("unplugged");
    let mut r = router();
    let err = r.route_gpu(&ctx, &hidden, 3).await.unwrap_err();
    assert!(
        matches!(err, Error::DeviceUnavailable(ref reason) if reason.contains("unplugged")),
        "got {err:?}"
    );
    assert_eq!(r.stats().total_tokens, 0);
}

#[tokio::test]
async fn routing_without_gate_weights_is_a_configuration_error() {
    let ctx = default_context().await;
    let mut r = MoeRouter::new(MoeConfig {
        num_experts: 2,
        top_k: 1,
        hidden_size: 2,
        normalize_weights: false,
    })
    .unwrap();
    let err = r.route_gpu(&ctx, &[1.0, 2.0], 1).await.unwrap_err();
    assert!(matches!(err, Error::Configuration(_)), "got {err:?}");
}
