//! Terminal dashboard over the coordinator's REST API.
//! Tasks (every task the coordinator still tracks)
//! Models (registered models and where they are deployed)
//! Settings (the live settings snapshot)

use std::{
  env,
  error::Error,
  io,
  sync::mpsc,
  thread,
  time::{Duration, Instant},
};

use crossterm::{
  event::{self, DisableMouseCapture, EnableMouseCapture, Event as CEvent, KeyCode},
  execute,
  terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use tokio::runtime::Runtime;
use tui::{
  Terminal,
  backend::{Backend, CrosstermBackend},
  layout::{Constraint, Direction, Layout, Rect},
  style::{Color, Modifier, Style},
  text::{Span, Spans},
  widgets::{Block, Borders, List, ListItem, Paragraph, Tabs},
};

use mlcoord::config::Settings;
use mlcoord::models::{ModelClusterState, ModelMeta, Task, TaskState};

#[derive(Clone, Copy)]
enum DashboardTab {
  Tasks,
  Models,
  Settings,
}

struct App {
  current_tab: DashboardTab,
  tasks: Vec<Task>,
  models: Vec<ModelMeta>,
  settings: Option<Settings>,
  last_error: Option<String>,
}

impl App {
  fn new() -> Self {
    Self {
      current_tab: DashboardTab::Tasks,
      tasks: vec![],
      models: vec![],
      settings: None,
      last_error: None,
    }
  }

  fn next_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Tasks => DashboardTab::Models,
      DashboardTab::Models => DashboardTab::Settings,
      DashboardTab::Settings => DashboardTab::Tasks,
    }
  }

  fn previous_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Tasks => DashboardTab::Settings,
      DashboardTab::Models => DashboardTab::Tasks,
      DashboardTab::Settings => DashboardTab::Models,
    }
  }

  fn apply(&mut self, snapshot: Snapshot) {
    match snapshot {
      Ok((mut tasks, models, settings)) => {
        tasks.sort_by(|a, b| b.last_update_time.cmp(&a.last_update_time));
        self.tasks = tasks;
        self.models = models;
        self.settings = Some(settings);
        self.last_error = None;
      }
      Err(e) => self.last_error = Some(e),
    }
  }
}

type Snapshot = Result<(Vec<Task>, Vec<ModelMeta>, Settings), String>;

async fn fetch_state(client: &reqwest::Client, api_url: &str) -> Result<(Vec<Task>, Vec<ModelMeta>, Settings), reqwest::Error> {
  let tasks = client.get(format!("{}/tasks", api_url)).send().await?.error_for_status()?.json().await?;
  let models = client.get(format!("{}/models", api_url)).send().await?.error_for_status()?.json().await?;
  let settings = client.get(format!("{}/settings", api_url)).send().await?.error_for_status()?.json().await?;
  Ok((tasks, models, settings))
}

fn main() -> Result<(), Box<dyn Error>> {
  let api_url = env::var("API_URL").unwrap_or_else(|_| "http://localhost:8080".into());
  let api_url = api_url.trim_end_matches('/').to_string();

  let (tx, rx) = mpsc::channel::<Snapshot>();
  thread::spawn(move || {
    let rt_bg = match Runtime::new() {
      Ok(rt) => rt,
      Err(e) => {
        let _ = tx.send(Err(format!("failed to start runtime: {}", e)));
        return;
      }
    };
    let client = reqwest::Client::new();
    loop {
      let snapshot = rt_bg.block_on(fetch_state(&client, &api_url)).map_err(|e| e.to_string());
      if tx.send(snapshot).is_err() {
        break;
      }
      thread::sleep(Duration::from_secs(2));
    }
  });

  enable_raw_mode()?;
  let mut stdout = io::stdout();
  execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
  let backend = CrosstermBackend::new(stdout);
  let mut terminal = Terminal::new(backend)?;

  let mut app = App::new();
  let tick_rate = Duration::from_millis(500);
  let mut last_tick = Instant::now();

  loop {
    while let Ok(snapshot) = rx.try_recv() {
      app.apply(snapshot);
    }
    terminal.draw(|f| ui(f, &app))?;

    let timeout = tick_rate
      .checked_sub(last_tick.elapsed())
      .unwrap_or_else(|| Duration::from_secs(0));
    if event::poll(timeout)? {
      if let CEvent::Key(key) = event::read()? {
        match key.code {
          KeyCode::Char('q') => break,
          KeyCode::Right => app.next_tab(),
          KeyCode::Left => app.previous_tab(),
          _ => {}
        }
      }
    }
    if last_tick.elapsed() >= tick_rate {
      last_tick = Instant::now();
    }
  }

  disable_raw_mode()?;
  execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
  terminal.show_cursor()?;
  Ok(())
}

fn ui<B: Backend>(f: &mut tui::Frame<B>, app: &App) {
  let chunks = Layout::default()
    .direction(Direction::Vertical)
    .margin(1)
    .constraints([
      Constraint::Length(3),
      Constraint::Min(0),
      Constraint::Length(3),
    ].as_ref())
    .split(f.size());

  let tab_titles = vec!["Tasks", "Models", "Settings"];
  let tabs = Tabs::new(
    tab_titles
      .iter()
      .map(|t| Spans::from(Span::styled(*t, Style::default().fg(Color::Yellow))))
      .collect(),
  )
    .block(Block::default().borders(Borders::ALL).title("ML Cluster"))
    .highlight_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
    .select(match app.current_tab {
      DashboardTab::Tasks => 0,
      DashboardTab::Models => 1,
      DashboardTab::Settings => 2,
    });
  f.render_widget(tabs, chunks[0]);

  match app.current_tab {
    DashboardTab::Tasks => render_tasks(f, app, chunks[1]),
    DashboardTab::Models => render_models(f, app, chunks[1]),
    DashboardTab::Settings => render_settings(f, app, chunks[1]),
  }

  let footer_text = match &app.last_error {
    Some(e) => format!("API unreachable: {} | q: Quit", e),
    None => "←/→: Switch Tabs | q: Quit".to_string(),
  };
  let footer_style = if app.last_error.is_some() { Color::Red } else { Color::White };
  let footer = Paragraph::new(footer_text)
    .style(Style::default().fg(footer_style))
    .block(Block::default().borders(Borders::ALL));
  f.render_widget(footer, chunks[2]);
}

fn state_color(state: TaskState) -> Color {
  match state {
    TaskState::Created => Color::Gray,
    TaskState::Running => Color::Yellow,
    TaskState::Completed => Color::Green,
    TaskState::Failed => Color::Red,
  }
}

fn task_items(tasks: Vec<&Task>) -> Vec<ListItem<'static>> {
  tasks
    .into_iter()
    .map(|t| {
      let mut lines = vec![
        Spans::from(vec![
          Span::styled(t.state.as_str(), Style::default().fg(state_color(t.state)).add_modifier(Modifier::BOLD)),
          Span::raw(format!(" {} {}", t.task_type, t.task_id)),
        ]),
        Spans::from(Span::raw(format!(
          "  model: {} | nodes: {}",
          t.model_id.as_deref().unwrap_or("-"),
          t.worker_node_ids.iter().map(|n| n.0.as_str()).collect::<Vec<_>>().join(",")
        ))),
      ];
      if let Some(error) = &t.error {
        lines.push(Spans::from(Span::styled(format!("  {}", error), Style::default().fg(Color::Red))));
      }
      ListItem::new(lines)
    })
    .collect()
}

fn render_tasks<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let chunks = Layout::default()
    .direction(Direction::Horizontal)
    .constraints([Constraint::Percentage(50), Constraint::Percentage(50)].as_ref())
    .split(area);

  let (active, finished): (Vec<&Task>, Vec<&Task>) = app.tasks.iter().partition(|t| !t.state.is_terminal());

  let active_list = List::new(task_items(active))
    .block(Block::default().borders(Borders::ALL).title("Active Tasks"));
  f.render_widget(active_list, chunks[0]);
  let finished_list = List::new(task_items(finished))
    .block(Block::default().borders(Borders::ALL).title("Finished (awaiting acknowledgement)"));
  f.render_widget(finished_list, chunks[1]);
}

fn render_models<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let model_items: Vec<ListItem> = app.models.iter().map(|m| {
    let color = match m.state {
      ModelClusterState::Loaded => Color::Green,
      ModelClusterState::PartiallyLoaded | ModelClusterState::Loading => Color::Yellow,
      ModelClusterState::LoadFailed => Color::Red,
      ModelClusterState::Registered | ModelClusterState::Unloaded => Color::Gray,
    };
    ListItem::new(vec![
      Spans::from(vec![
        Span::styled(format!("{} ", m.model_id), Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)),
        Span::raw(format!("{} v{} ({}) ", m.name, m.version, m.function_name)),
        Span::styled(format!("{:?}", m.state), Style::default().fg(color)),
      ]),
      Spans::from(Span::raw(format!(
        "  deployed {}/{}: {}",
        m.deployed_nodes.len(),
        m.planning_worker_node_count,
        m.deployed_nodes.iter().map(|n| n.0.as_str()).collect::<Vec<_>>().join(",")
      ))),
    ])
  }).collect();
  let models_list = List::new(model_items)
    .block(Block::default().borders(Borders::ALL).title(format!("Models ({})", app.models.len())));
  f.render_widget(models_list, area);
}

fn render_settings<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let lines: Vec<ListItem> = match &app.settings {
    Some(s) => [
      ("node timeout", format!("{} ms", s.node_timeout_ms)),
      ("deploy deadline", format!("{} ms", s.deploy_deadline_ms)),
      ("execute deadline", format!("{} ms", s.execute_deadline_ms)),
      ("worker pool", format!("{} threads, queue {}", s.worker_pool_size, s.worker_queue_capacity)),
      ("max running loads", s.max_running_load_tasks.to_string()),
      ("forward retries", format!("{} from {} ms", s.forward_retries, s.forward_retry_delay_ms)),
      ("custom deployment plan", s.allow_custom_deployment_plan.to_string()),
    ]
      .into_iter()
      .map(|(k, v)| {
        ListItem::new(Spans::from(vec![
          Span::styled(format!("{:<24}", k), Style::default().fg(Color::Green)),
          Span::raw(v),
        ]))
      })
      .collect(),
    None => vec![ListItem::new(Spans::from(Span::raw("waiting for the coordinator...")))],
  };
  let settings_list = List::new(lines)
    .block(Block::default().borders(Borders::ALL).title("Settings"));
  f.render_widget(settings_list, area);
}
