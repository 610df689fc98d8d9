#[tokio::main]
async fn main() -> controller::Result<()> {
    controller::init_tracing();
    tracing::info!(
        version = controller::version::VERSION,
        git_sha = controller::version::GIT_SHA,
        built_at = controller::version::BUILD_TIMESTAMP,
        "controller starting"
    );
    controller::run().await
}
