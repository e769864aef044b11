use tracing_subscriber::EnvFilter;

/// 初始化日志
///
/// 设置了 `RUST_LOG` 时以它为准，否则使用传入的级别。重复调用不会覆盖已有的订阅者
pub fn init(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}
