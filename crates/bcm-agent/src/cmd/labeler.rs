use std::sync::Arc;

use anyhow::Result;
use utils::version;

use crate::app::ShutdownSignals;
use crate::app::Tasks;
use crate::config::resolve_node_name;
use crate::config::LabelerArgs;
use crate::fact_source::FactSource;
use crate::fact_source::FileFactSource;
use crate::fact_source::SocketFactSource;
use crate::k8s::KubeNodeApi;
use crate::k8s::NodeReconciler;
use crate::labeler::Labeler;
use crate::metrics::server::MetricsServer;
use crate::metrics::MetricsSnapshot;
use crate::metrics::SharedMetrics;

pub async fn run_labeler(args: LabelerArgs) -> Result<()> {
    utils::logging::init(args.log.level());

    tracing::info!("Starting bcm-agent labeler {}", &**version::VERSION);

    let signals = ShutdownSignals::install()?;
    let node_name = resolve_node_name(args.node_name.as_deref())?;
    tracing::info!(
        "Node: {node_name}, label prefix: {}, sync interval: {}s",
        args.label_prefix,
        args.interval
    );

    let source: Box<dyn FactSource> = match &args.source_socket {
        Some(socket) => Box::new(SocketFactSource::new(socket, &node_name)),
        None => Box::new(FileFactSource::new(&args.source_file, &node_name)),
    };

    let metrics = SharedMetrics::new(MetricsSnapshot::empty(&node_name, !args.disable_labeling));
    let mut labeler = Labeler::new(&node_name, &args.label_prefix, source, metrics.clone());

    if args.disable_labeling {
        tracing::info!("Node labeling disabled, running in metrics-only mode");
    } else {
        let api = KubeNodeApi::connect(args.kubeconfig.as_deref())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize Kubernetes client: {e:?}"))?;
        let api = Arc::new(api);
        labeler = labeler.with_reconciler(NodeReconciler::new(api, &args.label_prefix));
    }

    let mut tasks = Tasks::new(args.shutdown_timeout());
    tasks.spawn_metrics_server(MetricsServer::new(args.metrics_listen_addr(), metrics));
    tasks.spawn_labeler(labeler, args.interval());
    tasks.wait_for_completion(signals.recv()).await?;

    tracing::info!("Labeler stopped");
    Ok(())
}
