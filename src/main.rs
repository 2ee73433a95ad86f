//! Local demo of the orchestration runtime.
//!
//! Wires a scripted model, an in-memory provider catalog and an approval
//! channel that approves every prompt, then runs one turn and prints it.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use agent_core::{
    AgentRuntime, ApprovalBroker, CapabilityHandler, CapabilityRegistry, ChannelApprovalHandler,
    Credentials, FunctionDef, InMemoryConfigStore, OrchestratorConfig, ProviderCatalog,
    ProviderManifest,
};
use ai_agent::{
    FinishReason, ParamKind, ParamSpec, Role, ScriptedModel, StreamEvent, TokenUsage,
    ToolCallRequest, TurnObserver,
};
use async_trait::async_trait;
use clap::Parser;
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the demo
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Orchestrator config (JSON); defaults apply when missing
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Provider settings (JSON with a "providers" map)
    #[arg(short, long)]
    providers: Option<PathBuf>,

    /// Message to send
    #[arg(default_value = "add a note saying hello")]
    message: String,
}

struct NoteHandler;

#[async_trait]
impl CapabilityHandler for NoteHandler {
    async fn call(&self, args: Value, _credentials: Credentials) -> anyhow::Result<Value> {
        Ok(json!({ "saved": args["text"] }))
    }
}

struct ConsoleObserver;

impl TurnObserver for ConsoleObserver {
    fn on_chunk(&self, text: &str) {
        print!("{text}");
        let _ = std::io::stdout().flush();
    }

    fn on_tool_call(&self, call: &ToolCallRequest) {
        println!("[tool call] {} {}", call.name, call.arguments);
    }

    fn on_tool_result(&self, _call_id: &str, name: &str, result: &Value) {
        println!("[tool result] {name} {result}");
    }

    fn on_end(&self, _final_text: &str, usage: &TokenUsage) {
        println!("\n[usage] {} in / {} out", usage.input_tokens, usage.output_tokens);
    }

    fn on_error(&self, message: &str) {
        eprintln!("[error] {message}");
    }
}

fn demo_model() -> ScriptedModel {
    ScriptedModel::responding(|request| {
        let answered = request
            .messages
            .last()
            .map(|message| message.role == Role::Tool)
            .unwrap_or(false);
        let target = request
            .tools
            .iter()
            .find(|tool| tool.name.starts_with("notes__"));
        match target {
            Some(tool) if !answered => vec![
                StreamEvent::tool_call("call-1", tool.name.clone(), json!({ "text": "hello" })),
                StreamEvent::finish(FinishReason::ToolCalls, TokenUsage::new(24, 6)),
            ],
            _ => ScriptedModel::reply("The note is saved.", TokenUsage::new(30, 5)),
        }
    })
}

fn demo_catalog() -> ProviderCatalog {
    let catalog = ProviderCatalog::new();
    catalog.load(
        ProviderManifest::new("notes", "Notes", "productivity")
            .describe("Scratch notes kept in memory")
            .function(
                FunctionDef::new("add_note", "Add a note", Arc::new(NoteHandler)).with_params(
                    vec![ParamSpec::new("text", ParamKind::String)
                        .required()
                        .describe("Note body")],
                ),
            ),
    );
    catalog
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,agent_core=debug,ai_agent=debug")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => OrchestratorConfig::load(path)?,
        None => OrchestratorConfig::default(),
    };
    let store = match &args.providers {
        Some(path) => InMemoryConfigStore::load(path)?,
        None => {
            let store = InMemoryConfigStore::new();
            store.set_enabled("notes", true);
            store
        }
    };

    let registry = Arc::new(CapabilityRegistry::new(
        Arc::new(demo_catalog()),
        Arc::new(store),
    ));
    registry.rebuild();

    let broker = ApprovalBroker::new();
    let (approvals, mut prompts) =
        ChannelApprovalHandler::new(broker.clone(), config.channel_approval_timeout());
    tokio::spawn(async move {
        while let Some(prompt) = prompts.recv().await {
            info!(function = %prompt.function_name, "auto-approving");
            let _ = broker.resolve(&prompt.correlation_id, true);
        }
    });

    let runtime = AgentRuntime::builder(registry)
        .with_config(config)
        .with_model(Arc::new(demo_model()))
        .with_approval_handler(approvals)
        .build();

    runtime
        .run_turn(Vec::new(), &args.message, &ConsoleObserver, None)
        .await?;

    if let Some(root) = runtime.ledger_root_hash().await {
        println!("[ledger] {root}");
    }
    Ok(())
}
