fn main() {
    chainwatch_node::init_logger();

    if let Err(err) = chainwatch_node::run() {
        tracing::error!("Fatal error: {err}");
        std::process::exit(1);
    }
}
