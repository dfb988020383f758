//! 日志引擎演示
//!
//! 生成一对服务端密钥，用公钥建 sink 写一批日志，
//! 再用私钥把日志目录解码回来。
//!
//! 运行: cargo run --example logger_demo

use std::sync::Arc;
use std::time::Instant;

use efflog::{crypt, decode, src_loc, LogHandle, LogLevel, Sink, SinkConfig, StagingSink};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (server_priv, server_pub) = crypt::generate_key_pair();
    println!("server secret key: {}", crypt::key_to_hex(&server_priv));

    let dir = std::env::temp_dir().join("efflog_demo");
    let conf = SinkConfig {
        dir: dir.clone(),
        prefix: "demo".to_string(),
        pub_key: crypt::key_to_hex(&server_pub),
        ..Default::default()
    };

    let sink = StagingSink::new(conf)?;
    let handle = LogHandle::with_sink(Arc::clone(&sink) as Arc<dyn Sink>);

    let begin = Instant::now();
    for i in 0..1000 {
        handle.log(LogLevel::Info, src_loc!(), &format!("demo message {i}"));
    }
    handle.flush();
    println!("logged 1000 records in {:?}", begin.elapsed());

    let mut total = 0usize;
    for entry in std::fs::read_dir(&dir)?.flatten() {
        let path = entry.path();
        if path.extension().map(|ext| ext == "log").unwrap_or(false) {
            total += decode::read_file(&path, &server_priv)?.len();
        }
    }
    println!("decoded {total} records back from {}", dir.display());

    Ok(())
}
