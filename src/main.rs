#[macro_use]
extern crate tracing;

use axum::{
    http::StatusCode,
    routing::get,
    Router,
};
use clap::Parser;
use eyre::{
    Context as _,
    Result,
};
use route53_ingress_controller::{
    controller::{
        Controller,
        ControllerConfig,
        Updater,
    },
    dns::{
        frontends::FrontendDiscovery,
        route53::Route53Provider,
        DnsUpdater,
    },
    k8s::KubeApi,
    metrics,
};
use std::{
    net::SocketAddr,
    sync::Arc,
};

#[derive(Parser)]
#[command(version, about)]
struct Args {
    #[clap(
        long,
        env = "INGRESS_CLASS",
        default_value = "edge",
        help = "Ingress class handled by this controller"
    )]
    ingress_class: String,

    #[clap(
        long,
        env = "INCLUDE_CLASSLESS",
        help = "Also handle ingresses without any ingress class"
    )]
    include_classless: bool,

    #[clap(
        long,
        env = "NAMESPACE_SELECTOR",
        help = "Only consider ingresses in namespaces matching this label selector"
    )]
    namespace_selector: Option<String>,

    #[clap(
        long,
        env = "HOSTED_ZONE_ID",
        help = "Route53 hosted zone to reconcile records in"
    )]
    hosted_zone_id: String,

    #[clap(
        long,
        env = "ELB_CLUSTER_LABEL",
        help = "Discover frontends from classic ELBs tagged with this cluster label"
    )]
    elb_cluster_label: Option<String>,

    #[clap(
        long,
        env = "ALB_NAMES",
        value_delimiter = ',',
        help = "Discover frontends from these named ALBs"
    )]
    alb_names: Vec<String>,

    #[clap(
        long,
        env = "STATIC_HOSTNAMES",
        value_delimiter = ',',
        value_parser = parse_scheme_hostname,
        help = "Static scheme=hostname frontend pairs, addressed by CNAME"
    )]
    static_hostnames: Vec<(String, String)>,

    #[clap(
        long,
        env = "DEFAULT_ALLOW",
        value_delimiter = ',',
        help = "Default allow list for entries without an allow annotation"
    )]
    default_allow: Vec<String>,

    #[clap(long, env = "DEFAULT_SCHEME", default_value = "internal")]
    default_scheme: String,

    #[clap(long, env = "DEFAULT_STRIP_PATHS")]
    default_strip_paths: bool,

    #[clap(long, env = "DEFAULT_EXACT_PATHS")]
    default_exact_paths: bool,

    #[clap(long, env = "DEFAULT_BACKEND_TIMEOUT_SECONDS", default_value_t = 10)]
    default_backend_timeout_seconds: u32,

    #[clap(long, env = "DEFAULT_BACKEND_MAX_CONNECTIONS", default_value_t = 1024)]
    default_backend_max_connections: u32,

    #[clap(long, env = "DEFAULT_PROXY_BUFFER_SIZE_KB", default_value_t = 8)]
    default_proxy_buffer_size: u32,

    #[clap(long, env = "DEFAULT_PROXY_BUFFER_BLOCKS", default_value_t = 4)]
    default_proxy_buffer_blocks: u32,

    #[clap(
        long,
        env = "HEALTH_ADDR",
        default_value = "0.0.0.0:12082",
        help = "Listen address for the /health and /metrics endpoints"
    )]
    health_addr: SocketAddr,
}

fn parse_scheme_hostname(value: &str) -> Result<(String, String), String> {
    value
        .split_once('=')
        .map(|(scheme, hostname)| (scheme.to_string(), hostname.to_string()))
        .ok_or_else(|| format!("expected scheme=hostname, got {value:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install().expect("color_eyre init");
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let kube_client = kube::Client::try_default()
        .await
        .context("failed to create kubernetes client")?;
    let aws_config = aws_config::load_from_env().await;

    let provider = Arc::new(Route53Provider::new(
        aws_sdk_route53::Client::new(&aws_config),
        args.hosted_zone_id.clone(),
    ));
    let discovery = FrontendDiscovery {
        elb: aws_sdk_elasticloadbalancing::Client::new(&aws_config),
        alb: aws_sdk_elasticloadbalancingv2::Client::new(&aws_config),
        elb_cluster_label: args.elb_cluster_label.clone(),
        alb_names: args.alb_names.clone(),
        static_hostnames: args.static_hostnames.iter().cloned().collect(),
    };
    let dns: Arc<dyn Updater> = Arc::new(DnsUpdater::new(provider, Box::new(discovery)));

    let config = ControllerConfig {
        ingress_class: args.ingress_class,
        include_classless: args.include_classless,
        namespace_selector: args.namespace_selector,
        default_allow: args.default_allow,
        default_scheme: args.default_scheme,
        default_strip_paths: args.default_strip_paths,
        default_exact_paths: args.default_exact_paths,
        default_backend_timeout_seconds: args.default_backend_timeout_seconds,
        default_backend_max_connections: args.default_backend_max_connections,
        default_proxy_buffer_size: args.default_proxy_buffer_size,
        default_proxy_buffer_blocks: args.default_proxy_buffer_blocks,
    };

    let controller = Arc::new(Controller::new(
        Arc::new(KubeApi::new(kube_client)),
        vec![dns],
        config,
    ));

    controller
        .start()
        .await
        .context("failed to start controller")?;

    let server = tokio::spawn(serve_health(args.health_addr, controller.clone()));

    shutdown_signal().await;
    info!("shutting down");

    server.abort();
    controller.stop().await?;
    Ok(())
}

async fn serve_health(addr: SocketAddr, controller: Arc<Controller>) {
    let app = Router::new()
        .route(
            "/health",
            get(move || {
                let controller = controller.clone();
                async move {
                    match controller.health() {
                        Ok(()) => (StatusCode::OK, "ok\n".to_string()),
                        Err(err) => (StatusCode::SERVICE_UNAVAILABLE, format!("{err:#}\n")),
                    }
                }
            }),
        )
        .route("/metrics", get(|| async { metrics::gather() }));

    match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => {
            info!("serving health and metrics on {addr}");
            if let Err(err) = axum::serve(listener, app).await {
                error!("health server failed: {err}");
            }
        }
        Err(err) => error!("failed to bind health server on {addr}: {err}"),
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{
        signal,
        SignalKind,
    };

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(err) => {
            error!("failed to install SIGTERM handler: {err}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}
