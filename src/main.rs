#[tokio::main]
async fn main() {
    if let Err(e) = dentaflow_lib::run().await {
        eprintln!("dentaflow: {e}");
        std::process::exit(1);
    }
}
