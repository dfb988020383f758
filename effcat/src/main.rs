//! effcat - 日志离线解码工具
//!
//! 三种用法:
//!   effcat gen-keys                            # 生成服务端密钥对
//!   effcat parse -i logs/ -k <私钥hex>          # 解码成可读文本
//!   effcat info -i app_xxx.log                 # 查看块结构（无需密钥）

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use efflog::{crypt, decode, LogLevel, LogRecord};

#[derive(Parser)]
#[command(name = "effcat")]
#[command(about = "Offline decoder for efflog rotated log files")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// 详细输出
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// 生成服务端 ECDH 密钥对（公钥配给 sink，私钥留给解码方）
    GenKeys,

    /// 解码日志文件或目录
    Parse {
        /// 输入 .log 文件或其所在目录
        #[arg(short, long)]
        input: PathBuf,

        /// 服务端私钥（十六进制）
        #[arg(short = 'k', long)]
        secret_key: String,

        /// 输出文件路径，缺省打到标准输出
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// 按 JSON 行输出
        #[arg(long)]
        json: bool,

        /// 跳过损坏数据继续解
        #[arg(long)]
        tolerant: bool,
    },

    /// 查看文件块结构（无需密钥）
    Info {
        /// 输入 .log 文件
        #[arg(short, long)]
        input: PathBuf,
    },
}

#[derive(Serialize)]
struct JsonRecord<'a> {
    level: &'a str,
    timestamp_ms: i64,
    pid: i32,
    tid: i32,
    file: &'a str,
    line: u32,
    func: &'a str,
    message: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::GenKeys => run_gen_keys(),
        Commands::Parse {
            input,
            secret_key,
            output,
            json,
            tolerant,
        } => run_parse(&input, &secret_key, output.as_deref(), json, tolerant),
        Commands::Info { input } => run_info(&input),
    }
}

fn run_gen_keys() -> Result<()> {
    let (secret_key, public_key) = crypt::generate_key_pair();
    println!("public key (sink config): {}", crypt::key_to_hex(&public_key));
    println!("secret key (decoder):     {}", crypt::key_to_hex(&secret_key));
    Ok(())
}

/// 输入是目录时取目录下全部 .log，按修改时间从旧到新
fn collect_inputs(input: &Path) -> Result<Vec<PathBuf>> {
    if input.is_file() {
        return Ok(vec![input.to_path_buf()]);
    }
    if !input.is_dir() {
        bail!("{} is neither a file nor a directory", input.display());
    }

    let mut files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    for entry in std::fs::read_dir(input)
        .with_context(|| format!("read dir {}", input.display()))?
        .flatten()
    {
        let path = entry.path();
        if path.extension().map(|ext| ext == "log").unwrap_or(false) {
            let modified = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            files.push((path, modified));
        }
    }
    files.sort_by(|lhs, rhs| lhs.1.cmp(&rhs.1).then_with(|| lhs.0.cmp(&rhs.0)));
    Ok(files.into_iter().map(|(path, _)| path).collect())
}

fn run_parse(
    input: &Path,
    secret_key: &str,
    output: Option<&Path>,
    json: bool,
    tolerant: bool,
) -> Result<()> {
    let key = crypt::hex_to_key(secret_key).context("bad secret key")?;

    let files = collect_inputs(input)?;
    if files.is_empty() {
        bail!("no .log files under {}", input.display());
    }

    let mut writer: Box<dyn Write> = match output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("create {}", path.display()))?,
        )),
        None => Box::new(std::io::stdout().lock()),
    };

    let mut total = 0usize;
    let mut errors = 0usize;
    for file in &files {
        let records = if tolerant {
            let (records, file_errors) = decode::read_file_tolerant(file, &key);
            errors += file_errors;
            records
        } else {
            decode::read_file(file, &key)
                .with_context(|| format!("decode {}", file.display()))?
        };

        for record in &records {
            write_record(&mut writer, record, json)?;
        }
        total += records.len();
        info!("effcat: {} -> {} records", file.display(), records.len());
    }
    writer.flush()?;

    if errors > 0 {
        warn!("effcat: skipped {} corrupted chunks/items", errors);
    }
    info!("effcat: {} records from {} files", total, files.len());
    Ok(())
}

fn write_record(writer: &mut dyn Write, record: &LogRecord, json: bool) -> Result<()> {
    if !json {
        writeln!(writer, "{record}")?;
        return Ok(());
    }

    let level = LogLevel::from_i32(record.level)
        .map(|l| l.as_str())
        .unwrap_or("?");
    let line = serde_json::to_string(&JsonRecord {
        level,
        timestamp_ms: record.timestamp_ms,
        pid: record.pid,
        tid: record.tid,
        file: &record.file_name,
        line: record.line,
        func: &record.func_name,
        message: record.content_text(),
    })?;
    writeln!(writer, "{line}")?;
    Ok(())
}

fn run_info(input: &Path) -> Result<()> {
    let chunks =
        decode::scan_file(input).with_context(|| format!("scan {}", input.display()))?;

    println!("{}: {} chunks", input.display(), chunks.len());
    for (index, chunk) in chunks.iter().enumerate() {
        println!(
            "  chunk {:>3}: offset={:<10} payload={:<8} items={:<6} key={}...",
            index,
            chunk.offset,
            chunk.payload_size,
            chunk.item_count,
            &chunk.session_key_hex[..16.min(chunk.session_key_hex.len())]
        );
    }
    Ok(())
}
