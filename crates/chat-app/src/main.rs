use kosmos::ChatApp;
use kosmos::chat::{ChatId, GenerationOutcome};
use kosmos::settings::{EDITABLE_SETTINGS, SettingsStore};
use kosmos_storage::JsonFileStore;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};

const HELP: &str = "\
commands:
  /new [type] [model]   start a chat (general, code, creative, analysis)
  /list                 chats, most recent first
  /open <id>            open a chat
  /delete <id>          delete a chat
  /search <text>        search titles and messages
  /history              messages of the open chat
  /remove <index>       remove a message (negative counts from the end)
  /title                refresh the open chat's title
  /enhance <prompt>     rewrite a prompt
  /models               models offered by the backend
  /types                chat types
  /set <key> <value>    change user_name or default_model and save it
  /quit                 save and exit
anything else is sent to the open chat. Ctrl-C stops a reply, or exits at the prompt.";

struct Console {
    stdout: Stdout,
}

impl Console {
    async fn write(&mut self, text: &str) {
        let _ = self.stdout.write_all(text.as_bytes()).await;
        let _ = self.stdout.flush().await;
    }

    async fn line(&mut self, text: impl AsRef<str>) {
        self.write(text.as_ref()).await;
        self.write("\n").await;
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let settings_store = SettingsStore::load();
    let mut app = match ChatApp::from_settings(&settings_store.settings()) {
        Ok(app) => app,
        Err(error) => {
            tracing::error!(error = %error, "failed to start");
            std::process::exit(1);
        }
    };

    let mut console = Console {
        stdout: tokio::io::stdout(),
    };
    console.line(HELP).await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        console.write("> ").await;
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => {
                console.write("\n").await;
                break;
            }
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(error) => {
                tracing::error!(error = %error, "failed to read input");
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }

        if let Some(command) = line.strip_prefix('/') {
            run_command(&mut app, &settings_store, &mut console, command).await;
        } else {
            run_prompt(&mut app, &mut console, line).await;
        }
    }

    app.shutdown();
}

async fn run_command(
    app: &mut ChatApp<JsonFileStore>,
    settings_store: &SettingsStore,
    console: &mut Console,
    command: &str,
) {
    let (name, argument) = command
        .split_once(char::is_whitespace)
        .map(|(name, argument)| (name, argument.trim()))
        .unwrap_or((command, ""));

    match name {
        "new" => {
            let mut parts = argument.split_whitespace();
            let chat_type = parts.next().unwrap_or("general");
            let chat = app.new_chat(chat_type, parts.next());
            console
                .line(format!("{} [{}] {}", chat.id, chat.chat_type.label(), chat.model_name))
                .await;
        }
        "list" | "search" => {
            let summaries = if name == "list" {
                app.chat_summaries()
            } else {
                app.search(argument)
            };
            if summaries.is_empty() {
                console.line("no chats").await;
            }
            for summary in summaries {
                console
                    .line(format!(
                        "{}  {}  {} ({} messages, {})",
                        summary.id,
                        summary.last_message_at.format("%Y-%m-%d %H:%M"),
                        summary.title,
                        summary.message_count,
                        summary.chat_type.as_str()
                    ))
                    .await;
            }
        }
        "open" | "delete" => {
            let Some(chat_id) = parse_chat_id(console, argument).await else {
                return;
            };
            if name == "delete" {
                let message = if app.delete_chat(chat_id) { "deleted" } else { "no such chat" };
                console.line(message).await;
                return;
            }
            match app.get_chat(chat_id).map(|chat| chat.title.clone()) {
                Some(title) => console.line(format!("opened: {title}")).await,
                None => console.line("no such chat").await,
            }
        }
        "history" => {
            let lines = app
                .history()
                .iter()
                .enumerate()
                .map(|(index, message)| {
                    format!("[{index}] {}: {}", message.role.as_str(), message.content)
                })
                .collect::<Vec<_>>();
            for line in lines {
                console.line(line).await;
            }
        }
        "remove" => match argument.parse::<isize>() {
            Ok(index) => match app.remove_message(index) {
                Ok(message) => console.line(format!("removed {} message", message.role.as_str())).await,
                Err(error) => console.line(format!("error: {error}")).await,
            },
            Err(_) => console.line("usage: /remove <index>").await,
        },
        "title" => {
            let Some(chat_id) = app.current_chat().map(|chat| chat.id) else {
                console.line("no open chat").await;
                return;
            };
            match app.refresh_title(chat_id).await {
                Ok(title) => console.line(format!("title: {title}")).await,
                Err(error) => console.line(format!("error: {error}")).await,
            }
        }
        "enhance" => {
            let enhanced = app.enhance_prompt(argument).await;
            console.line(enhanced).await;
        }
        "models" => {
            let catalog = app.available_models().await;
            if let Some(warning) = &catalog.warning {
                console.line(format!("({warning})")).await;
            }
            for model in catalog.models {
                console.line(format!("  {}", model.id)).await;
            }
        }
        "types" => {
            for (chat_type, label) in app.chat_types() {
                console.line(format!("  {:<10} {label}", chat_type.as_str())).await;
            }
        }
        "set" => {
            let Some((key, value)) = argument.split_once(char::is_whitespace) else {
                console
                    .line(format!("usage: /set <{}> <value>", EDITABLE_SETTINGS.join("|")))
                    .await;
                return;
            };
            let mut settings = (*settings_store.settings()).clone();
            let saved = settings
                .set_field(key, value.trim())
                .and_then(|()| settings_store.update(settings));
            match saved {
                Ok(()) => {
                    app.apply_settings(&settings_store.settings());
                    let path = settings_store.config_path().display();
                    console.line(format!("saved to {path}")).await;
                }
                Err(error) => console.line(format!("error: {error}")).await,
            }
        }
        "help" => console.line(HELP).await,
        other => console.line(format!("unknown command /{other}; try /help")).await,
    }
}

async fn parse_chat_id(console: &mut Console, raw: &str) -> Option<ChatId> {
    match ChatId::parse(raw) {
        Ok(chat_id) => Some(chat_id),
        Err(error) => {
            console.line(format!("invalid chat id '{raw}': {error}")).await;
            None
        }
    }
}

async fn run_prompt(app: &mut ChatApp<JsonFileStore>, console: &mut Console, prompt: &str) {
    let mut run = match app.start_generation(prompt, true) {
        Ok(run) => run,
        Err(error) => {
            console.line(format!("error: {error} (try /new)")).await;
            return;
        }
    };

    let cancel = run.cancel_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    while let Some(fragment) = run.next_fragment().await {
        console.write(&fragment).await;
    }
    interrupt.abort();
    console.write("\n").await;

    let report = match app.finish_generation(run) {
        Ok(report) => report,
        Err(error) => {
            tracing::warn!(error = %error, "failed to finish generation");
            return;
        }
    };
    if report.outcome == GenerationOutcome::Cancelled {
        console.line("(stopped)").await;
    }
    if report.committed {
        match app.refresh_title(report.chat_id).await {
            Ok(title) => console.line(format!("[{title}]")).await,
            Err(error) => tracing::warn!(error = %error, "failed to refresh title"),
        }
    }
}
