use std::io;
use std::time::Duration;

use crossterm::event::KeyEventKind;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::prelude::*;

mod app;
mod cache;
mod config;
mod db;
mod error;
mod models;
mod tui;

use app::App;
use config::Config;
use db::Repository;
use error::{AppError, Result};
use tui::{draw, handle_key_event};

/// Headless commands that run instead of the TUI.
enum Command {
    Migrate,
    List,
    Toggle(i64),
    RepairCounts,
}

fn parse_command(args: &[String]) -> Result<Option<Command>> {
    let command = match args.get(1).map(String::as_str) {
        None => None,
        Some("--migrate") => Some(Command::Migrate),
        Some("--list") => Some(Command::List),
        Some("--repair-counts") => Some(Command::RepairCounts),
        Some("--toggle") => {
            let id = args
                .get(2)
                .ok_or_else(|| anyhow::anyhow!("--toggle needs a post id"))?;
            let id = id
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid post id: {}", id))?;
            Some(Command::Toggle(id))
        }
        Some(other) => return Err(anyhow::anyhow!("unknown argument: {}", other).into()),
    };
    Ok(command)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging (only show warnings and errors by default)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let command = parse_command(&args)?;

    // Load configuration
    let config = Config::load()?;

    if let Some(command) = command {
        return run_headless(&config, command).await;
    }

    // Initialize app
    let mut app = App::new(&config).await?;

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    // Run the app
    let result = run_app(&mut terminal, &mut app).await;

    // Restore terminal
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    if let Err(e) = result {
        eprintln!("Error: {}", e);
    }

    Ok(())
}

async fn run_headless(config: &Config, command: Command) -> Result<()> {
    // Opening the repository runs any pending migrations
    let repository = Repository::new(&config.db_path).await?;

    match command {
        Command::Migrate => {
            let version = repository.schema_version().await?;
            let users = repository.list_users().await?;
            println!(
                "Database {} at schema version {} ({} users)",
                config.db_path,
                version,
                users.len()
            );
        }
        Command::List => {
            let posts = repository.list_feed(config.user_id).await?;
            println!("{}", serde_json::to_string_pretty(&posts)?);
        }
        Command::Toggle(post_id) => {
            let post = repository
                .get_feed_post(post_id, config.user_id)
                .await?
                .ok_or(AppError::PostNotFound(post_id))?;
            let updated = repository
                .toggle_like(post, config.user_id, config.like_counter)
                .await?;
            println!("{}", serde_json::to_string_pretty(&updated)?);
        }
        Command::RepairCounts => {
            let changed = repository.repair_like_counts().await?;
            println!("Repaired {} posts", changed);
            for post in repository.list_feed(config.user_id).await? {
                let rows = repository.count_likes(post.id).await?;
                println!(
                    "  post {}: likes_count={} like_rows={}",
                    post.id, post.likes_count, rows
                );
            }
        }
    }

    Ok(())
}

async fn run_app<B: Backend>(terminal: &mut Terminal<B>, app: &mut App) -> Result<()> {
    loop {
        terminal.draw(|frame| draw(frame, app))?;

        // Check for finished background writes and reads
        app.poll_like_results();
        app.poll_refresh_result();

        // Settled mutations leave the feed stale
        app.refetch_if_stale();

        // Poll for events with timeout to allow async operations
        if event::poll(Duration::from_millis(100))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    if let Some(action) = handle_key_event(key, app.show_help) {
                        let should_quit = app.handle_action(action).await?;
                        if should_quit {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_headless_flags() {
        assert!(parse_command(&args(&["pocket-feed"])).unwrap().is_none());
        assert!(matches!(
            parse_command(&args(&["pocket-feed", "--toggle", "2"])).unwrap(),
            Some(Command::Toggle(2))
        ));
        assert!(matches!(
            parse_command(&args(&["pocket-feed", "--repair-counts"])).unwrap(),
            Some(Command::RepairCounts)
        ));
    }

    #[test]
    fn rejects_bad_flags() {
        assert!(parse_command(&args(&["pocket-feed", "--toggle"])).is_err());
        assert!(parse_command(&args(&["pocket-feed", "--toggle", "two"])).is_err());
        assert!(parse_command(&args(&["pocket-feed", "--sync"])).is_err());
    }
}
