// ==========================================
// 价目表导入系统 - 命令行入口
// ==========================================
// 用法: price-list-ingest <db_path> <supplier_id> <file> [mime_type]
// 选项: 环境变量 PRICE_LIST_INGEST_OPTIONS 可给出 UploadOptions JSON
// 输出: stdout 打印 UploadOutcome JSON，日志写 stderr
// ==========================================

use price_list_ingest::{logging, UploadApi, UploadOptions};
use std::path::PathBuf;
use std::process::ExitCode;

const OPTIONS_ENV: &str = "PRICE_LIST_INGEST_OPTIONS";

fn usage() -> ExitCode {
    eprintln!("用法: price-list-ingest <db_path> <supplier_id> <file> [mime_type]");
    eprintln!("      {}='{{\"duplicateHandling\":\"merge\"}}' 可覆盖上传选项", OPTIONS_ENV);
    ExitCode::from(2)
}

fn load_options() -> Result<UploadOptions, Box<dyn std::error::Error>> {
    match std::env::var(OPTIONS_ENV) {
        Ok(raw) if !raw.trim().is_empty() => Ok(serde_json::from_str(&raw)?),
        _ => Ok(UploadOptions::default()),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    logging::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 3 || args.len() > 4 {
        return Ok(usage());
    }
    let db_path = &args[0];
    let supplier_id = &args[1];
    let file = PathBuf::from(&args[2]);
    let mime_type = args.get(3).map(|s| s.as_str());

    tracing::info!("==================================================");
    tracing::info!("{} v{}", price_list_ingest::APP_NAME, price_list_ingest::VERSION);
    tracing::info!("使用数据库: {}", db_path);
    tracing::info!("==================================================");

    let options = load_options()?;
    let api = UploadApi::new(db_path).await?;
    let outcome = api.upload_file(&file, supplier_id, mime_type, options).await?;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(if outcome.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
