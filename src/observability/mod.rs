//! 可观测性

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 安装全局 subscriber：默认 info，可用 RUST_LOG 覆盖；重复调用不报错
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
