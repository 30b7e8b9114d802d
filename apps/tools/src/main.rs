use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use shared::domain::{CategoryId, ItemId};
use storage::Storage;

/// Direct database maintenance. Writes made here bypass the server's change
/// feed; running presenters pick them up on resync.
#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/verses.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateCategory {
        name: String,
    },
    AddItem {
        category_id: i64,
        text: String,
    },
    /// Creates (or reuses) a category and appends one item per non-empty line.
    Seed {
        name: String,
        file: PathBuf,
    },
    Activate {
        item_id: i64,
    },
    Delete {
        item_id: i64,
    },
    List {
        category_id: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::CreateCategory { name } => {
            let category_id = storage.create_category(&name).await?;
            println!("created category_id={}", category_id.0);
        }
        Command::AddItem { category_id, text } => {
            let item = storage.insert_item(CategoryId(category_id), &text).await?;
            println!("created item_id={}", item.id.0);
        }
        Command::Seed { name, file } => {
            let contents = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let category_id = storage.create_category(&name).await?;
            let mut count = 0;
            for line in contents.lines().map(str::trim).filter(|line| !line.is_empty()) {
                storage.insert_item(category_id, line).await?;
                count += 1;
            }
            println!("seeded category_id={} with {count} items", category_id.0);
        }
        Command::Activate { item_id } => {
            let item = storage
                .get_item(ItemId(item_id))
                .await?
                .ok_or_else(|| anyhow!("item {item_id} not found"))?;
            storage.deactivate_category(item.category_id).await?;
            storage.set_active(item.id, true).await?;
            println!("activated item_id={item_id} in category_id={}", item.category_id.0);
        }
        Command::Delete { item_id } => match storage.delete_item(ItemId(item_id)).await? {
            Some(item) => println!("deleted item_id={} from category_id={}", item.id.0, item.category_id.0),
            None => println!("item_id={item_id} not found"),
        },
        Command::List { category_id: None } => {
            for category in storage.list_categories().await? {
                println!("{:>4}  {}", category.id.0, category.name);
            }
        }
        Command::List {
            category_id: Some(category_id),
        } => {
            for item in storage.list_items(CategoryId(category_id)).await? {
                let marker = if item.active { '*' } else { ' ' };
                println!("{marker}{:>4}  r{}  {}", item.id.0, item.revision, item.text);
            }
        }
    }

    Ok(())
}
