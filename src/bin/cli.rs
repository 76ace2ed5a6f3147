use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use reqwest::{Client, Response};
use serde_json::Value;

use orchestrator_domain::WorkflowGraph;
use orchestrator_infrastructure::load_definitions_dir;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = CliApp::parse();
    cli.run().await
}

/// CLI应用程序主结构
#[derive(Parser, Debug)]
#[command(name = "orchestrator-cli")]
#[command(version)]
#[command(about = "工作流编排调度核心 - 命令行管理工具")]
struct CliApp {
    #[command(subcommand)]
    command: Commands,

    /// API服务器基础URL
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    api_url: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 运行实例
    Runs(RunCommands),
    /// 工作流
    Workflows(WorkflowCommands),
    /// 工作流定义
    Definitions(DefinitionCommands),
}

#[derive(Args, Debug)]
struct RunCommands {
    #[command(subcommand)]
    action: RunActions,
}

#[derive(Subcommand, Debug)]
enum RunActions {
    /// 列出运行实例
    List {
        /// 工作流名称
        #[arg(short, long)]
        workflow: Option<String>,
        /// 状态过滤: running/success/failed/cancelled
        #[arg(short, long)]
        state: Option<String>,
        /// 最多显示数量
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },
    /// 查看运行实例及其任务实例
    Show {
        run_id: i64,
    },
    /// 取消运行实例
    Cancel {
        run_id: i64,
    },
}

#[derive(Args, Debug)]
struct WorkflowCommands {
    #[command(subcommand)]
    action: WorkflowActions,
}

#[derive(Subcommand, Debug)]
enum WorkflowActions {
    /// 列出已登记的工作流
    List,
    /// 暂停工作流
    Pause { name: String },
    /// 恢复工作流
    Unpause { name: String },
}

#[derive(Args, Debug)]
struct DefinitionCommands {
    #[command(subcommand)]
    action: DefinitionActions,
}

#[derive(Subcommand, Debug)]
enum DefinitionActions {
    /// 校验目录中的工作流定义（离线，不需要API服务）
    Validate { dir: PathBuf },
}

impl CliApp {
    async fn run(self) -> Result<()> {
        let base = self.api_url.trim_end_matches('/').to_string();
        match self.command {
            Commands::Runs(cmd) => handle_run_commands(cmd, &base).await,
            Commands::Workflows(cmd) => handle_workflow_commands(cmd, &base).await,
            Commands::Definitions(cmd) => handle_definition_commands(cmd).await,
        }
    }
}

async fn handle_run_commands(cmd: RunCommands, base: &str) -> Result<()> {
    let client = create_http_client()?;

    match cmd.action {
        RunActions::List {
            workflow,
            state,
            limit,
        } => {
            let mut query = vec![("limit", limit.to_string())];
            if let Some(workflow) = workflow {
                query.push(("workflow", workflow));
            }
            if let Some(state) = state {
                query.push(("state", state));
            }
            let response = client
                .get(format!("{base}/api/runs"))
                .query(&query)
                .send()
                .await
                .context("获取运行实例列表失败")?;
            let body = read_data(response, "获取运行实例列表失败").await?;
            print_runs_table(&body);
        }
        RunActions::Show { run_id } => {
            let response = client
                .get(format!("{base}/api/runs/{run_id}"))
                .send()
                .await
                .context("获取运行实例详情失败")?;
            let body = read_data(response, "获取运行实例详情失败").await?;
            print_run_details(&body);
        }
        RunActions::Cancel { run_id } => {
            let response = client
                .post(format!("{base}/api/runs/{run_id}/cancel"))
                .send()
                .await
                .context("取消运行实例失败")?;
            let body = read_data(response, "取消运行实例失败").await?;
            if body["already_finished"].as_bool().unwrap_or(false) {
                println!("运行实例 {run_id} 已结束，无需取消");
            } else {
                let count = body["cancelled_instances"].as_array().map_or(0, Vec::len);
                println!("运行实例 {run_id} 已取消，共取消 {count} 个任务实例");
            }
        }
    }

    Ok(())
}

async fn handle_workflow_commands(cmd: WorkflowCommands, base: &str) -> Result<()> {
    let client = create_http_client()?;

    match cmd.action {
        WorkflowActions::List => {
            let response = client
                .get(format!("{base}/api/workflows"))
                .send()
                .await
                .context("获取工作流列表失败")?;
            let body = read_data(response, "获取工作流列表失败").await?;
            print_workflows_table(&body);
        }
        WorkflowActions::Pause { name } => {
            let response = client
                .post(format!("{base}/api/workflows/{name}/pause"))
                .send()
                .await
                .context("暂停工作流失败")?;
            read_data(response, "暂停工作流失败").await?;
            println!("工作流 {name} 已暂停");
        }
        WorkflowActions::Unpause { name } => {
            let response = client
                .post(format!("{base}/api/workflows/{name}/unpause"))
                .send()
                .await
                .context("恢复工作流失败")?;
            read_data(response, "恢复工作流失败").await?;
            println!("工作流 {name} 已恢复");
        }
    }

    Ok(())
}

async fn handle_definition_commands(cmd: DefinitionCommands) -> Result<()> {
    match cmd.action {
        DefinitionActions::Validate { dir } => {
            let scan = load_definitions_dir(&dir)
                .await
                .with_context(|| format!("读取定义目录失败: {}", dir.display()))?;
            let mut errors = scan.errors;
            let (graphs, rejected) = WorkflowGraph::load_all(scan.definitions);
            errors.extend(rejected);

            for graph in &graphs {
                println!(
                    "✓ {} ({}，{} 个任务)",
                    graph.name(),
                    graph.definition().schedule,
                    graph.topological_order().len()
                );
            }
            for error in &errors {
                println!("✗ {error}");
            }

            if !errors.is_empty() {
                anyhow::bail!("{} 个定义校验失败", errors.len());
            }
            println!("全部 {} 个定义校验通过", graphs.len());
        }
    }

    Ok(())
}

fn create_http_client() -> Result<Client> {
    Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .context("创建HTTP客户端失败")
}

/// 取出响应中的 `data`，非 2xx 时带上服务端的错误信息
async fn read_data(response: Response, action: &str) -> Result<Value> {
    let status = response.status();
    let body: Value = response.json().await.with_context(|| format!("{action}: 响应不是JSON"))?;
    if !status.is_success() {
        let message = body["error"]["message"].as_str().unwrap_or("未知错误");
        anyhow::bail!("{action} ({status}): {message}");
    }
    Ok(body["data"].clone())
}

fn text<'a>(value: &'a Value, key: &str) -> &'a str {
    value[key].as_str().unwrap_or("-")
}

fn print_runs_table(runs: &Value) {
    println!(
        "{:<8} {:<24} {:<26} {:<10} {:<26}",
        "ID", "工作流", "逻辑日期", "状态", "结束时间"
    );
    println!("{}", "-".repeat(98));

    for run in runs.as_array().into_iter().flatten() {
        println!(
            "{:<8} {:<24} {:<26} {:<10} {:<26}",
            run["id"].as_i64().unwrap_or_default(),
            text(run, "workflow_name"),
            text(run, "logical_date"),
            text(run, "state"),
            text(run, "ended_at"),
        );
    }
}

fn print_run_details(detail: &Value) {
    let run = &detail["run"];
    println!("运行实例详情:");
    println!("  ID: {}", run["id"].as_i64().unwrap_or_default());
    println!("  工作流: {}", text(run, "workflow_name"));
    println!("  逻辑日期: {}", text(run, "logical_date"));
    println!(
        "  数据区间: {} ~ {}",
        text(run, "data_interval_start"),
        text(run, "data_interval_end")
    );
    println!("  状态: {}", text(run, "state"));
    println!();
    println!(
        "{:<20} {:<16} {:<8} {:<20} {}",
        "任务", "状态", "尝试", "Worker", "失败原因"
    );
    println!("{}", "-".repeat(90));

    for task in detail["tasks"].as_array().into_iter().flatten() {
        let attempts = format!(
            "{}/{}",
            task["attempt"].as_u64().unwrap_or_default(),
            task["max_attempts"].as_u64().unwrap_or_default()
        );
        let reason = match (task["failure_kind"].as_str(), task["error_message"].as_str()) {
            (Some(kind), Some(message)) => format!("[{kind}] {message}"),
            (None, Some(message)) => message.to_string(),
            _ => String::new(),
        };
        println!(
            "{:<20} {:<16} {:<8} {:<20} {}",
            text(task, "task_id"),
            text(task, "state"),
            attempts,
            text(task, "worker_id"),
            reason
        );
    }
}

fn print_workflows_table(workflows: &Value) {
    println!(
        "{:<28} {:<8} {:<16} {}",
        "名称", "暂停", "调度", "任务"
    );
    println!("{}", "-".repeat(80));

    for workflow in workflows.as_array().into_iter().flatten() {
        let tasks = workflow["tasks"]
            .as_array()
            .map(|tasks| {
                tasks
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(" → ")
            })
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<28} {:<8} {:<16} {}",
            text(workflow, "name"),
            workflow["paused"].as_bool().unwrap_or_default(),
            text(workflow, "schedule"),
            tasks
        );
    }
}
