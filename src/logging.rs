// ==========================================
// 日志系统初始化
// ==========================================
// 使用 tracing 和 tracing-subscriber
// 日志级别: RUST_LOG 优先，其次为调用方给定的默认值
// ==========================================

use tracing_subscriber::{fmt, EnvFilter};

/// 默认日志级别
pub const DEFAULT_LEVEL: &str = "info";

/// 初始化日志系统
///
/// # 环境变量
/// - RUST_LOG: 日志级别过滤器（默认: info）
///   例如: RUST_LOG=debug 或 RUST_LOG=price_list_ingest::engine=trace
///
/// # 示例
/// ```no_run
/// use price_list_ingest::logging;
/// logging::init();
/// ```
pub fn init() {
    init_with_default(DEFAULT_LEVEL);
}

/// 以指定默认级别初始化（RUST_LOG 存在时以其为准）
///
/// 输出到 stderr，stdout 留给 CLI 的 JSON 结果
pub fn init_with_default(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .try_init();
}

/// 初始化测试环境的日志系统
///
/// 使用更详细的日志级别，便于调试
pub fn init_test() {
    let _ = fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}
