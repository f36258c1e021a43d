use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use pipeline_loadbalancer::{
    DEFAULT_DRAIN_TIMEOUT_MS, LoadBalancer, LoadBalancerConfiguration, dispatcher::DispatchReport,
};
use pipeline_plugin::{
    PeerConnectionInformation, PipelinePlugin, PipelinePluginConfiguration, PluginError,
    PluginRuntime,
    connection::{Inbound, Outbound, PipelinePull, PipelinePush},
    plugin_test_util::{FakePluginManager, free_local_address},
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct CountingWorker {
    id: String,
    counts: Arc<Mutex<HashMap<String, usize>>>,
}

#[async_trait]
impl PipelinePlugin for CountingWorker {
    async fn process(&mut self, input: String) -> anyhow::Result<Option<String>> {
        *self.counts.lock().unwrap().entry(self.id.clone()).or_default() += 1;
        Ok(Some(format!("{input}@{}", self.id)))
    }
}

struct Pipeline {
    producer: PipelinePush,
    consumer: PipelinePull,
    balancer: JoinHandle<Result<DispatchReport, PluginError>>,
    workers: Vec<JoinHandle<Result<(), PluginError>>>,
    counts: Arc<Mutex<HashMap<String, usize>>>,
    token: CancellationToken,
}

/// Upstream producer, a load balancer with `workers` workers and a consumer
/// connected to the balancer's downstream.
async fn start(workers: usize, consumer_buffer: usize) -> Pipeline {
    let token = CancellationToken::new();
    let upstream = free_local_address();
    let downstream = free_local_address();
    let worker_manager = free_local_address();

    let producer = PipelinePush::open(&PeerConnectionInformation::bind(upstream.clone()), token.clone())
        .await
        .unwrap();

    let config = LoadBalancerConfiguration {
        pipeline: PipelinePluginConfiguration::new("balancer", "127.0.0.1:1"),
        workers,
        worker_manager: worker_manager.clone(),
        dispatch: free_local_address(),
        sink: free_local_address(),
        max_retries: 3,
        ack_timeout_ms: 2_000,
        drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT_MS,
    };
    let runtime = PluginRuntime::with_manager(
        config.pipeline.clone(),
        Arc::new(FakePluginManager::new(
            PeerConnectionInformation::connect(upstream),
            PeerConnectionInformation::bind(downstream.clone()),
        )),
    );
    let balancer = tokio::spawn(LoadBalancer::new(config).run(runtime));

    let counts = Arc::new(Mutex::new(HashMap::new()));
    let mut handles = Vec::new();
    for i in 0..workers {
        let mut worker_config = PipelinePluginConfiguration::new(format!("w{i}"), worker_manager.clone());
        worker_config.registration_retries = 20;
        let plugin = CountingWorker {
            id: format!("w{i}"),
            counts: counts.clone(),
        };
        handles.push(tokio::spawn(PluginRuntime::new(worker_config).run(plugin)));
    }

    let consumer = PipelinePull::open(
        &PeerConnectionInformation::connect(downstream),
        consumer_buffer,
        token.clone(),
    )
    .await
    .unwrap();

    Pipeline {
        producer,
        consumer,
        balancer,
        workers: handles,
        counts,
        token,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn workers_share_the_stream_evenly() {
    const WORKERS: usize = 3;
    const MESSAGES: usize = 30;

    let Pipeline {
        mut producer,
        mut consumer,
        balancer,
        workers,
        counts,
        token,
    } = start(WORKERS, 64).await;

    for i in 0..MESSAGES {
        producer.push(format!("m{i}")).await.unwrap();
    }
    let mut results = Vec::new();
    for _ in 0..MESSAGES {
        results.push(consumer.pull().await.unwrap().unwrap());
    }
    drop(producer);

    let report = balancer.await.unwrap().unwrap();
    assert_eq!(report.acknowledged(), MESSAGES as u64);
    assert_eq!(report.removed(), 0);
    for outcome in &report.workers {
        assert_eq!(outcome.acknowledged, (MESSAGES / WORKERS) as u64);
    }

    let counts = counts.lock().unwrap().clone();
    assert_eq!(counts.len(), WORKERS);
    assert!(counts.values().all(|&c| c == MESSAGES / WORKERS));
    assert!(results.iter().all(|r| r.contains('@')));

    for worker in workers {
        worker.await.unwrap().unwrap();
    }
    token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn acknowledged_results_survive_the_end_of_the_stream() {
    const WORKERS: usize = 3;
    const MESSAGES: usize = 3_000;

    let Pipeline {
        mut producer,
        mut consumer,
        balancer,
        workers,
        token,
        ..
    } = start(WORKERS, MESSAGES).await;

    for i in 0..MESSAGES {
        producer.push(format!("m{i}")).await.unwrap();
    }
    drop(producer);

    // nothing is read downstream until the balancer has finished
    let report = tokio::time::timeout(Duration::from_secs(30), balancer)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.acknowledged(), MESSAGES as u64);

    let mut delivered = 0;
    while let Some(result) = tokio::time::timeout(Duration::from_secs(5), consumer.pull())
        .await
        .unwrap()
        .unwrap()
    {
        assert!(result.contains('@'));
        delivered += 1;
    }
    assert_eq!(delivered, MESSAGES);

    for worker in workers {
        worker.await.unwrap().unwrap();
    }
    token.cancel();
}
