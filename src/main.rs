use anyhow::Context;
use flowstate::{Clock, Command, DelayCommand, FlowRegistry, FlowService, InMemoryStateRepository, ServiceConfig, State};
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Pequeño menú interactivo sobre un `FlowService` en memoria.
///
/// Pasos registrados:
/// - `saludo`: imprime el estado y lo termina.
/// - `nunca`: no hace nada; el recoverer lo reintenta hasta agotar intentos.
///
/// Opciones soportadas:
/// 1) Iniciar estado (commit + ejecución)
/// 2) Commit sin ejecutar (queda para el recoverer)
/// 3) Pausar con delay
/// 4) Ver estado
/// 5) Estadísticas
/// 6) Salir
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
                             .init();

    let clock = Clock::new();
    let repo = Arc::new(InMemoryStateRepository::with_clock(clock));
    let registry = Arc::new(FlowRegistry::new());
    registry.set_fn("saludo", |ctx, engine| {
                println!("\n[{}] hola desde {} (rev {})", engine.now(), ctx.id(), ctx.committed.rev);
                Ok(Command::commit(vec![Command::end(ctx.clone())]))
            });
    registry.set_fn("nunca", |_, _| Ok(Command::noop()));

    let config = ServiceConfig::from_env().context("configuración inválida")?;
    let service = FlowService::start(repo.clone(), registry, config, clock)?;
    info!("demo iniciada");

    loop {
        println!("\n== flowstate demo ==");
        println!("1) Iniciar estado en 'saludo'");
        println!("2) Commit en 'nunca' sin ejecutar");
        println!("3) Pausar y reanudar en 'saludo' tras un delay");
        println!("4) Ver estado");
        println!("5) Estadísticas");
        println!("6) Salir");
        let choice = prompt("Elige una opción: ")?;
        match choice.trim() {
            "1" => {
                let id = read_id()?;
                match service.start_state(State::new(id), "saludo") {
                    Ok(ctx) => println!("Estado {} iniciado en rev {}", ctx.id(), ctx.committed.rev),
                    Err(e) => eprintln!("Error iniciando estado: {}", e),
                }
            }
            "2" => {
                let id = read_id()?;
                match service.engine().commit(vec![Command::transit(State::new(id.clone()).to_ctx(), "nunca")]) {
                    Ok(_) => println!("Estado {} commiteado; el recoverer lo reintentará", id),
                    Err(e) => eprintln!("Error en commit: {}", e),
                }
            }
            "3" => {
                let id = read_id()?;
                let secs: u64 = match prompt("Segundos de espera: ")?.trim().parse() {
                    Ok(n) => n,
                    Err(_) => {
                        eprintln!("Número inválido");
                        continue;
                    }
                };
                let ctx = State::new(id.clone()).with_transit_to("saludo").to_ctx();
                let delay = DelayCommand::new(ctx.clone(), Duration::from_secs(secs));
                match service.engine().commit(vec![Command::pause(ctx), delay.into()]) {
                    Ok(_) => println!("Estado {} pausado; se reanuda en {}s", id, secs),
                    Err(e) => eprintln!("Error programando delay: {}", e),
                }
            }
            "4" => {
                let id = prompt("Id del estado: ")?;
                match service.engine().get_state_by_id(id.trim(), 0) {
                    Ok(ctx) => println!("{}", serde_json::to_string_pretty(&ctx.current)?),
                    Err(e) => eprintln!("Error leyendo estado: {}", e),
                }
            }
            "5" => {
                println!("recoverer: {:?}", service.recoverer_stats());
                println!("delayer:   {:?}", service.delayer_stats());
                println!("log:       {} revisiones", repo.head_rev()?);
            }
            "6" => {
                println!("Saliendo...");
                break;
            }
            other => println!("Opción inválida: {}", other),
        }
    }

    service.shutdown(Duration::from_secs(10)).await?;
    Ok(())
}

/// Id leído por teclado o uno nuevo si se deja vacío.
fn read_id() -> io::Result<String> {
    let raw = prompt("Id del estado (enter para generar uno): ")?;
    let raw = raw.trim();
    Ok(if raw.is_empty() { Uuid::new_v4().to_string() } else { raw.to_string() })
}

fn prompt(msg: &str) -> io::Result<String> {
    print!("{}", msg);
    io::stdout().flush()?;
    let mut s = String::new();
    io::stdin().read_line(&mut s)?;
    Ok(s)
}
