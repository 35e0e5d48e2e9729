mod client;
mod health;

use anyhow::Result;
use client::{ChatEvent, RelayClient, ReplyMode, TaggedEvent};
use crossterm::{
    event::{
        self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind, KeyModifiers,
    },
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use fanbot_shared::{ChatMessage, ClientChatRequest, HealthStatus, MessageRole};
use health::TimedCache;
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph, Wrap},
    Frame, Terminal,
};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const DEFAULT_RELAY_URL: &str = "http://127.0.0.1:8000";
const HEALTH_TTL: Duration = Duration::from_secs(30);
const HEALTH_POLL: Duration = Duration::from_secs(2);

enum RelayStatus {
    Unknown,
    Up(HealthStatus),
    Down(String),
}

/// Reply being received for the latest question.
struct PendingReply {
    generation: u64,
    mode: ReplyMode,
    question: ChatMessage,
    text: String,
}

struct App {
    /// Everything shown in the chat pane. Notices are kept apart.
    messages: Vec<ChatMessage>,
    notices: Vec<(usize, String)>,
    /// Completed sync-mode exchanges, the only turns re-sent as context.
    /// Streamed text cannot be told apart from a relay diagnostic, so it
    /// never goes back upstream.
    history: Vec<ChatMessage>,
    input: String,
    scroll: u16,
    mode: ReplyMode,
    status: RelayStatus,
    pending: Option<PendingReply>,
}

impl App {
    fn new() -> Self {
        Self {
            messages: Vec::new(),
            notices: vec![(
                0,
                "Welcome to FanBot! Ask about matches, stadiums or tickets.".to_string(),
            )],
            history: Vec::new(),
            input: String::new(),
            scroll: 0,
            mode: ReplyMode::Streaming,
            status: RelayStatus::Unknown,
            pending: None,
        }
    }

    fn notice(&mut self, text: impl Into<String>) {
        self.notices.push((self.messages.len(), text.into()));
    }

    /// Shows the question and builds the request for it.
    fn ask(&mut self, content: String) -> (ChatMessage, ClientChatRequest) {
        let question = ChatMessage::user(content);
        self.messages.push(question.clone());
        let messages = match self.mode {
            ReplyMode::Streaming => vec![question.clone()],
            ReplyMode::Whole => {
                let mut messages = self.history.clone();
                messages.push(question.clone());
                messages
            }
        };
        let request = ClientChatRequest {
            messages: Some(messages),
            ..Default::default()
        };
        (question, request)
    }

    fn start_reply(&mut self, generation: u64, question: ChatMessage) {
        self.pending = Some(PendingReply {
            generation,
            mode: self.mode,
            question,
            text: String::new(),
        });
    }

    fn append_reply(&mut self, generation: u64, chunk: &str) {
        if let Some(pending) = self.pending.as_mut() {
            if pending.generation == generation {
                pending.text.push_str(chunk);
            }
        }
    }

    /// Keeps whatever arrived on screen. Only a completed sync reply joins
    /// the history.
    fn finish_reply(&mut self, completed: bool) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        if pending.text.is_empty() {
            return;
        }
        let answer = ChatMessage::assistant(pending.text);
        if completed && pending.mode == ReplyMode::Whole {
            self.history.push(pending.question);
            self.history.push(answer.clone());
        }
        self.messages.push(answer);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Log to a file; the terminal belongs to the UI.
    if let Ok(file) = std::fs::File::create("fanbot-cli.log") {
        tracing_subscriber::fmt()
            .with_writer(file)
            .with_ansi(false)
            .init();
    }

    let relay_url = std::env::var("FANBOT_URL")
        .unwrap_or_else(|_| DEFAULT_RELAY_URL.to_string());

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new();
    let (client, mut events) = RelayClient::new(relay_url);

    let (ui_tx, mut ui_rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        while let Ok(event) = event::read() {
            if ui_tx.send(event).is_err() {
                break;
            }
        }
    });

    let res = run_app(&mut terminal, &mut app, client, &mut events, &mut ui_rx).await;

    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    if let Err(err) = res {
        println!("{err:?}");
    }

    Ok(())
}

async fn run_app<B: Backend>(
    terminal: &mut Terminal<B>,
    app: &mut App,
    mut client: RelayClient,
    events: &mut mpsc::UnboundedReceiver<TaggedEvent>,
    ui_rx: &mut mpsc::UnboundedReceiver<Event>,
) -> Result<()> {
    let health_cache = Arc::new(TimedCache::<HealthStatus>::new(HEALTH_TTL));
    let (health_tx, mut health_rx) = mpsc::unbounded_channel();
    let mut health_tick = tokio::time::interval(HEALTH_POLL);

    loop {
        terminal.draw(|f| ui(f, app))?;

        tokio::select! {
            _ = health_tick.tick() => {
                if let Some(status) = health_cache.peek().await {
                    app.status = RelayStatus::Up(status);
                    continue;
                }
                let cache = health_cache.clone();
                let fetch = client.fetch_health();
                let tx = health_tx.clone();
                tokio::spawn(async move {
                    let result = cache.get_or_refresh(|| fetch).await;
                    let _ = tx.send(result);
                });
            }
            Some(result) = health_rx.recv() => {
                app.status = match result {
                    Ok(status) => RelayStatus::Up(status),
                    Err(e) => RelayStatus::Down(e.to_string()),
                };
            }
            Some(event) = ui_rx.recv() => {
                let Event::Key(key) = event else { continue };
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                match key.code {
                    KeyCode::Char('q') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                        client.cancel();
                        return Ok(());
                    }
                    KeyCode::Char('s') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                        app.mode = match app.mode {
                            ReplyMode::Streaming => ReplyMode::Whole,
                            ReplyMode::Whole => ReplyMode::Streaming,
                        };
                    }
                    KeyCode::Esc => {
                        if client.cancel() {
                            app.finish_reply(false);
                            app.notice("Reply cancelled.");
                        }
                    }
                    KeyCode::Char(c) => {
                        app.input.push(c);
                    }
                    KeyCode::Backspace => {
                        app.input.pop();
                    }
                    KeyCode::Enter => {
                        let content = app.input.trim().to_string();
                        if !content.is_empty() {
                            app.input.clear();
                            // A newer question supersedes the reply still streaming.
                            if client.cancel() {
                                app.finish_reply(false);
                            }
                            let (question, request) = app.ask(content);
                            let generation = client.send(request, app.mode);
                            app.start_reply(generation, question);
                        }
                    }
                    KeyCode::Up => {
                        if app.scroll < app.messages.len() as u16 {
                            app.scroll += 1;
                        }
                    }
                    KeyCode::Down => {
                        if app.scroll > 0 {
                            app.scroll -= 1;
                        }
                    }
                    _ => {}
                }
            }
            Some(TaggedEvent { generation, event }) = events.recv() => {
                if !client.is_current(generation) {
                    continue;
                }
                match event {
                    ChatEvent::Delta(text) => app.append_reply(generation, &text),
                    ChatEvent::Finished => {
                        client.complete(generation);
                        app.finish_reply(true);
                    }
                    ChatEvent::Failed(reason) => {
                        client.complete(generation);
                        app.finish_reply(false);
                        app.notice(reason);
                    }
                    ChatEvent::Unreachable(reason) => {
                        client.complete(generation);
                        app.finish_reply(false);
                        app.notice(format!("Relay unreachable: {reason}"));
                        health_cache.invalidate().await;
                    }
                }
            }
        }
    }
}

fn ui(f: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Min(3),
            Constraint::Length(3),
        ])
        .split(f.area());

    let mode = match app.mode {
        ReplyMode::Streaming => "stream",
        ReplyMode::Whole => "sync",
    };
    let (status_color, status_text) = match &app.status {
        RelayStatus::Up(health) => (
            Color::Green,
            format!("● Connected · {} · {mode}", health.model),
        ),
        RelayStatus::Unknown => (Color::Yellow, format!("● Connecting... · {mode}")),
        RelayStatus::Down(e) => (Color::Red, format!("● Unreachable: {e} · {mode}")),
    };
    let status = Paragraph::new(status_text)
        .style(Style::default().fg(status_color))
        .block(Block::default());
    f.render_widget(status, chunks[0]);

    let mut items: Vec<ListItem> = Vec::new();
    let mut notices = app.notices.iter().peekable();
    for (index, msg) in app.messages.iter().enumerate() {
        while let Some((_, text)) = notices.next_if(|(at, _)| *at <= index) {
            items.push(message_item(MessageRole::System, text));
        }
        items.push(message_item(msg.role, &msg.content));
    }
    for (_, text) in notices {
        items.push(message_item(MessageRole::System, text));
    }
    if let Some(pending) = &app.pending {
        let content = if pending.text.is_empty() {
            "●●●"
        } else {
            pending.text.as_str()
        };
        items.push(message_item(MessageRole::Assistant, content));
    }

    let skip = (app.scroll as usize).min(items.len());
    let visible: Vec<ListItem> = items.into_iter().skip(skip).collect();
    let messages_list = List::new(visible)
        .block(Block::default().borders(Borders::ALL).title("FanBot"))
        .style(Style::default());
    f.render_widget(messages_list, chunks[1]);

    let input = Paragraph::new(app.input.as_str())
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title("Input (Esc cancel, Ctrl-S stream/sync, Ctrl-Q quit)"),
        )
        .wrap(Wrap { trim: true });
    f.render_widget(input, chunks[2]);
}

fn message_item(role: MessageRole, content: &str) -> ListItem<'static> {
    let (prefix, style) = match role {
        MessageRole::System => ("FanBot info", Style::default().fg(Color::Yellow)),
        MessageRole::User => ("You", Style::default().fg(Color::Cyan)),
        MessageRole::Assistant => ("FanBot", Style::default().fg(Color::Green)),
    };

    let mut lines = vec![Line::from(Span::styled(
        format!("{prefix}:"),
        style.add_modifier(Modifier::BOLD),
    ))];
    for line in content.lines() {
        lines.push(Line::from(Span::raw(line.to_string())));
    }
    lines.push(Line::from(""));

    ListItem::new(lines)
}
