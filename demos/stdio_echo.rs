//! Echo responder on stdin/stdout.
//!
//! ```text
//! echo '{"id":1,"method":"echo","params":["hi"]}' | cargo run --example stdio_echo
//! ```

use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use jsonrpc_pump::{
    CallHandler, ErrorCode, ErrorObject, PumpConfig, Request, Server, ServerConfig, Value,
};

#[derive(Parser, Debug)]
#[command(about = "Answer echo and ping calls on stdin/stdout")]
struct Args {
    /// Capacity of every pump queue
    #[arg(long, default_value_t = 10)]
    capacity: usize,

    /// Seconds to wait for the pumps to stop
    #[arg(long, default_value_t = 1)]
    stop_timeout: u64,
}

struct Echo;

#[async_trait]
impl CallHandler for Echo {
    async fn on_call(&mut self, request: Request) -> Result<Value, ErrorObject> {
        match request.method.as_str() {
            "echo" => Ok(Value::Array(request.params)),
            "ping" => Ok(Value::from("pong")),
            _ => Err(ErrorCode::MethodNotFound.into()),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let pump = PumpConfig::default().with_capacity(args.capacity);
    let config = ServerConfig::default().with_reader(pump).with_writer(pump);
    let mut server = Server::with_config(tokio::io::stdin(), tokio::io::stdout(), config);
    server.serve(&mut Echo).await?;
    // 残った応答を stdout に書き切ってから終了する
    server
        .finish(Duration::from_secs(args.stop_timeout))
        .await?;

    Ok(())
}
