use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use sakelog_api::{
    AddRootRequest, CategoryApi, LocalObjectStorage, DEFAULT_INLINE_MAX_WIDTH, MIN_INLINE_MAX_WIDTH,
};
use sakelog_core::{Actor, CategoryId, CategoryPostRequest};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "sakelog")]
#[command(about = "Sakelog category tree administration")]
struct Cli {
    #[arg(long, default_value = "./sakelog.sqlite3")]
    db: PathBuf,

    #[arg(long, default_value = "./objects")]
    object_dir: PathBuf,

    #[arg(long, default_value = "http://127.0.0.1:4020/objects")]
    public_base_url: String,

    #[arg(
        long,
        default_value_t = DEFAULT_INLINE_MAX_WIDTH,
        value_parser = clap::value_parser!(u32).range(i64::from(MIN_INLINE_MAX_WIDTH)..)
    )]
    inline_max_width: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Category {
        #[command(subcommand)]
        command: CategoryCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum CategoryCommand {
    AddRoot(AddRootArgs),
    Post(PostArgs),
    List,
    Tree(TreeArgs),
    Show(ShowArgs),
    /// Breadcrumb from the root down to the category.
    Trail(ShowArgs),
    /// The category id followed by every id below it.
    Descendants(ShowArgs),
    History(HistoryArgs),
}

#[derive(Debug, Args)]
struct ActorArgs {
    #[arg(long)]
    user_id: Option<String>,
    #[arg(long)]
    user_name: Option<String>,
}

#[derive(Debug, Args)]
struct AddRootArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    description: Option<String>,
    #[arg(long, default_value_t = false)]
    readonly: bool,
    #[arg(long)]
    order: Option<i64>,
    #[command(flatten)]
    actor: ActorArgs,
}

#[derive(Debug, Args)]
struct PostArgs {
    #[arg(long)]
    id: Option<CategoryId>,
    #[arg(long)]
    name: String,
    #[arg(long)]
    parent: CategoryId,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    version_no: Option<i64>,
    #[arg(long)]
    selected_version_no: Option<i64>,
    /// Image file to attach as the new category image.
    #[arg(long)]
    image: Option<PathBuf>,
    #[command(flatten)]
    actor: ActorArgs,
}

#[derive(Debug, Args)]
struct TreeArgs {
    #[arg(long)]
    root_id: Option<CategoryId>,
}

#[derive(Debug, Args)]
struct ShowArgs {
    #[arg(long)]
    id: CategoryId,
}

#[derive(Debug, Args)]
struct HistoryArgs {
    #[arg(long)]
    id: CategoryId,
    /// Show a single logged version instead of the full history.
    #[arg(long)]
    version_no: Option<i64>,
}

impl ActorArgs {
    fn actor(&self) -> Actor {
        Actor { user_id: self.user_id.clone(), user_name: self.user_name.clone() }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

// stdout carries JSON only, so logs go to stderr and stay quiet unless RUST_LOG asks.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let storage = Arc::new(LocalObjectStorage::new(cli.object_dir, cli.public_base_url));
    let api = CategoryApi::new(cli.db, storage).with_inline_max_width(cli.inline_max_width);
    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Category { command } => run_category(command, &api),
    }
}

fn run_db(command: DbCommand, api: &CategoryApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            let up_to_date = status.pending_versions.is_empty();
            let mut value = serde_json::to_value(&status)?;
            if let Value::Object(fields) = &mut value {
                fields.insert("up_to_date".to_string(), Value::Bool(up_to_date));
            }
            emit_json(value)
        }
        DbCommand::Migrate(args) => emit_json(serde_json::to_value(api.migrate(args.dry_run)?)?),
        DbCommand::Backup(args) => {
            api.backup(&args.out)?;
            emit_json(serde_json::json!({ "backup_path": args.out, "status": "ok" }))
        }
        DbCommand::Restore(args) => {
            let status = api.restore(&args.input)?;
            let mut value = serde_json::to_value(&status)?;
            if let Value::Object(fields) = &mut value {
                fields.insert("restored_from".to_string(), serde_json::json!(args.input));
            }
            emit_json(value)
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            let clean = report.is_clean();
            emit_json(
                serde_json::to_value(&report).context("failed to serialize integrity report")?,
            )?;
            if clean {
                Ok(())
            } else {
                Err(anyhow!("integrity check found problems"))
            }
        }
    }
}

fn run_category(command: CategoryCommand, api: &CategoryApi) -> Result<()> {
    match command {
        CategoryCommand::AddRoot(args) => {
            let request = AddRootRequest {
                name: args.name,
                description: args.description,
                readonly: args.readonly,
                order: args.order,
            };
            let root = api
                .add_root(&request, &args.actor.actor())
                .map_err(|err| anyhow!("{}: {err}", err.code()))?;
            emit_json(serde_json::to_value(&root)?)
        }
        CategoryCommand::Post(args) => run_category_post(&args, api),
        CategoryCommand::List => {
            let categories = api.list_categories()?;
            emit_json(serde_json::json!({ "categories": categories }))
        }
        CategoryCommand::Tree(args) => {
            let forest = api.category_tree(args.root_id)?;
            if let (Some(root_id), true) = (args.root_id, forest.is_empty()) {
                return Err(anyhow!("category {root_id} does not exist"));
            }
            emit_json(serde_json::json!({ "tree": forest }))
        }
        CategoryCommand::Show(args) => {
            let category = api
                .get_category(args.id)?
                .ok_or_else(|| anyhow!("category {} does not exist", args.id))?;
            emit_json(serde_json::to_value(&category)?)
        }
        CategoryCommand::Trail(args) => {
            let trail = api
                .category_trail(args.id)?
                .ok_or_else(|| anyhow!("category {} does not exist", args.id))?;
            emit_json(serde_json::json!({ "id": args.id, "trail": trail }))
        }
        CategoryCommand::Descendants(args) => {
            let ids = api
                .descendant_ids(args.id)?
                .ok_or_else(|| anyhow!("category {} does not exist", args.id))?;
            emit_json(serde_json::json!({ "id": args.id, "descendant_ids": ids }))
        }
        CategoryCommand::History(args) => match args.version_no {
            Some(version_no) => {
                let entry = api.get_log(args.id, version_no)?.ok_or_else(|| {
                    anyhow!("category {} has no logged version {version_no}", args.id)
                })?;
                emit_json(serde_json::to_value(&entry)?)
            }
            None => {
                let logs = api.list_logs(args.id)?;
                emit_json(serde_json::json!({ "id": args.id, "logs": logs }))
            }
        },
    }
}

fn run_category_post(args: &PostArgs, api: &CategoryApi) -> Result<()> {
    let image = args
        .image
        .as_ref()
        .map(|path| {
            fs::read(path).with_context(|| format!("failed to read image {}", path.display()))
        })
        .transpose()?;
    let request = CategoryPostRequest {
        id: args.id,
        name: args.name.clone(),
        parent: args.parent,
        description: args.description.clone(),
        version_no: args.version_no,
        selected_version_no: args.selected_version_no,
    };

    let id = api
        .post_category(&request, image.as_deref(), &args.actor.actor())
        .map_err(|err| anyhow!("{}: {err}", err.code()))?;
    let category =
        api.get_category(id)?.ok_or_else(|| anyhow!("category {id} vanished after commit"))?;
    emit_json(serde_json::json!({
        "id": id,
        "version_no": category.version_no
    }))
}
