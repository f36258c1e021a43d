use std::sync::Arc;

use async_trait::async_trait;
use hyperion::{
    config::{PipelineStage, PluginManagerConfiguration},
    manager::PluginManager,
};
use pipeline_plugin::{
    ConnectionType, PeerConnectionInformation, PipelinePlugin, PipelinePluginConfiguration,
    PluginError, PluginRegistration, PluginRuntime, SourcePlugin, StageRole,
    manager_client::{PluginManagerConnection, TcpPluginManagerConnection},
    plugin_test_util::{UppercasePlugin, free_local_address},
};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_util::sync::CancellationToken;

async fn start_manager(ids: &[&str]) -> (String, Vec<String>, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let hosts: Vec<String> = ids.iter().map(|_| free_local_address()).collect();
    let config = PluginManagerConfiguration {
        host: address.clone(),
        plugins: ids
            .iter()
            .zip(&hosts)
            .map(|(id, host)| PipelineStage {
                id: id.to_string(),
                host: host.clone(),
            })
            .collect(),
    };
    let manager = PluginManager::new(config);
    let token = manager.cancellation_token();
    tokio::spawn(manager.serve(listener));
    (address, hosts, token)
}

#[tokio::test]
async fn answers_follow_declared_order() {
    let (address, hosts, token) = start_manager(&["reader", "renamer", "printer"]).await;
    let client = TcpPluginManagerConnection::new(address);

    let ask = |id: &'static str, kind| {
        let request = PluginRegistration::new(id, kind);
        let client = &client;
        async move { client.request_config(&request).await.unwrap() }
    };

    assert_eq!(ask("printer", ConnectionType::Push).await, PeerConnectionInformation::absent(true));
    assert_eq!(
        ask("printer", ConnectionType::Pull).await,
        PeerConnectionInformation::connect(hosts[1].clone())
    );
    assert_eq!(ask("reader", ConnectionType::Pull).await, PeerConnectionInformation::absent(false));
    assert_eq!(
        ask("reader", ConnectionType::Push).await,
        PeerConnectionInformation::bind(hosts[0].clone())
    );

    let err = client
        .request_config(&PluginRegistration::new("stranger", ConnectionType::Pull))
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::Registration(_)));
    token.cancel();
}

#[tokio::test]
async fn concurrent_clients_all_get_answers() {
    let (address, _, token) = start_manager(&["a", "b", "c", "d"]).await;
    let client = Arc::new(TcpPluginManagerConnection::new(address));
    let mut tasks = Vec::new();
    for id in ["a", "b", "c", "d"] {
        for kind in [ConnectionType::Pull, ConnectionType::Push] {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                client.request_config(&PluginRegistration::new(id, kind)).await
            }));
        }
    }
    for task in tasks {
        assert!(task.await.unwrap().is_ok());
    }
    token.cancel();
}

struct Lines(Vec<String>);

#[async_trait]
impl SourcePlugin for Lines {
    async fn next_message(&mut self) -> anyhow::Result<Option<String>> {
        Ok(if self.0.is_empty() { None } else { Some(self.0.remove(0)) })
    }
}

struct Collect(mpsc::UnboundedSender<String>);

#[async_trait]
impl PipelinePlugin for Collect {
    async fn process(&mut self, input: String) -> anyhow::Result<Option<String>> {
        let _ = self.0.send(input.clone());
        Ok(Some(input))
    }

    fn role(&self) -> StageRole {
        StageRole::Sink
    }
}

#[tokio::test]
async fn pipeline_wired_through_the_manager() {
    let (address, _, token) = start_manager(&["source", "upper", "sink"]).await;
    let runtime = |id: &str| PluginRuntime::new(PipelinePluginConfiguration::new(id, address.clone()));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let sink = tokio::spawn(runtime("sink").run(Collect(tx)));
    let upper = tokio::spawn(runtime("upper").run(UppercasePlugin));
    let sent = runtime("source")
        .run_source(Lines(vec!["one".into(), "two".into()]))
        .await
        .unwrap();
    assert_eq!(sent, 2);

    upper.await.unwrap().unwrap();
    sink.await.unwrap().unwrap();
    assert_eq!(rx.recv().await.as_deref(), Some("ONE"));
    assert_eq!(rx.recv().await.as_deref(), Some("TWO"));
    token.cancel();
}
