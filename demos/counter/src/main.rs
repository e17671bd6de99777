use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::response::Html;
use axum::routing::get;
use clap::Parser;
use novylive::{
    EventHandler, EventKind, ObservableValue, RenderContext, RequestContext, Runtime,
    RuntimeConfig, Widget,
};

#[derive(Parser)]
#[command(name = "counter-demo")]
#[command(about = "Live counter page backed by server-held state")]
struct Cli {
    /// Address to serve on
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: String,

    /// Optional TOML config for runtime tuning
    #[arg(long)]
    config: Option<PathBuf>,
}

const PAGE_SCRIPT: &str = r#"<script>
const ws = new WebSocket(`ws://${location.host}/live`);
ws.onopen = () => {
  ws.send(JSON.stringify({ type: "subscribe", notifier_id: "counter" }));
};
ws.onmessage = (event) => {
  const msg = JSON.parse(event.data);
  if (msg.type === "value_change" && msg.id === "counter") {
    document.getElementById("count").textContent = msg.value;
  }
};
function invoke(path) {
  fetch(path, { method: "POST" });
}
</script>"#;

struct CounterPage {
    counter: ObservableValue<i64>,
}

impl Widget for CounterPage {
    fn render(&self, ctx: &RenderContext) -> String {
        let decrement = {
            let counter = self.counter.clone();
            ctx.callbacks().register(
                "counter-page",
                "button",
                EventKind::Press,
                EventHandler::no_arg(move |_| {
                    counter.update(|current| current - 1);
                }),
                ctx.request(),
            )
        };
        let increment = {
            let counter = self.counter.clone();
            ctx.callbacks().register(
                "counter-page",
                "button",
                EventKind::Press,
                EventHandler::no_arg(move |_| {
                    counter.update(|current| current + 1);
                }),
                ctx.request(),
            )
        };
        let reset = {
            let counter = self.counter.clone();
            ctx.callbacks().register(
                "counter-page",
                "button",
                EventKind::Press,
                EventHandler::no_arg(move |_| {
                    counter.set(0);
                }),
                ctx.request(),
            )
        };

        format!(
            "<!doctype html>\n<html>\n<head><title>Counter</title></head>\n<body>\n\
             <h1>Counter: <span id=\"count\">{count}</span></h1>\n\
             <button onclick=\"invoke('{dec}')\">-</button>\n\
             <button onclick=\"invoke('{inc}')\">+</button>\n\
             <button onclick=\"invoke('{rst}')\">reset</button>\n\
             {script}\n</body>\n</html>\n",
            count = self.counter.value(),
            dec = novylive::CallbackRegistry::endpoint_path(&decrement),
            inc = novylive::CallbackRegistry::endpoint_path(&increment),
            rst = novylive::CallbackRegistry::endpoint_path(&reset),
            script = PAGE_SCRIPT,
        )
    }
}

#[derive(Clone)]
struct App {
    runtime: Runtime,
    page: Arc<CounterPage>,
}

async fn page(State(app): State<App>) -> Html<String> {
    Html(app.runtime.render(app.page.as_ref(), RequestContext::new()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    };

    let runtime = Runtime::new(config);
    let counter = ObservableValue::with_id("counter", 0i64);
    runtime.store().register_notifier(&counter);

    let app = App {
        runtime: runtime.clone(),
        page: Arc::new(CounterPage { counter }),
    };
    let router = axum::Router::new()
        .route("/", get(page))
        .with_state(app)
        .merge(novylive::router(runtime));

    log::info!("counter demo starting on {}", cli.listen);
    novylive::serve(&cli.listen, router).await
}
