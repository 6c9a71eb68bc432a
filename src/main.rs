use std::{sync::Arc, time::Duration};

use clap::{Args, Parser, Subcommand};
use eyre::{OptionExt, eyre};
use futures::StreamExt;
use hacienda_router::{
    clock::{Clock, SystemClock},
    config::Config,
    coordinator::RouteRequest,
    db::{Db, KvStore},
    model::{Location, Route},
    navigator::{Navigator, ReplaySource},
    provider::OsrmClient,
    route_store::RouteSet,
    zones::sample_haciendas,
};
use mimalloc::MiMalloc;
use tracing::info;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Fixes are replayed this much faster than real time when simulating.
const SIMULATION_PLAYBACK: Duration = Duration::from_millis(20);

#[derive(Parser)]
#[command(author, version, about = "Plans routes around blocked haciendas", long_about = None)]
#[command(propagate_version = true)]
struct CliArgs {
    #[command(subcommand)]
    app: App,
}

#[derive(Subcommand)]
enum App {
    /// Compute routes and print them
    Route(RouteArgs),
    /// Compute a route, then drive along it and print progress events
    Simulate {
        #[command(flatten)]
        route: RouteArgs,
        /// simulated speed in meters per second
        #[arg(long, default_value_t = 15.)]
        speed: f64,
    },
    /// List the sample haciendas
    Zones,
    /// Remove every cached route and the stored position trail
    ClearCache,
}

#[derive(Args)]
struct RouteArgs {
    /// where to start, as lat,lng
    #[arg(allow_hyphen_values = true)]
    origin: Location,
    /// where to go, as lat,lng
    #[arg(allow_hyphen_values = true)]
    destination: Location,
    /// an intermediate stop, as lat,lng
    #[arg(long, allow_hyphen_values = true)]
    via: Option<Location>,
    /// name of a hacienda to block, can be repeated
    #[arg(long)]
    block: Vec<String>,
}
impl RouteArgs {
    fn request(&self) -> RouteRequest {
        let request = RouteRequest::new(self.origin, self.destination);
        match self.via {
            Some(via) => request.via(via),
            None => request,
        }
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt::init();
    let args = CliArgs::parse();

    let config = Config::from_env();
    let kv: Arc<dyn KvStore> = Arc::new(Db::open(&config.db_path)?);

    match args.app {
        App::Route(args) => {
            let navigator = open_navigator(&config, kv, &args.block)?;
            let set = navigator.compute_route(args.request()).await?;
            print_route_set(&set);
        }
        App::Simulate { route, speed } => {
            simulate(&config, kv, &route, speed).await?;
        }
        App::Zones => {
            for zone in sample_haciendas() {
                let corner = zone.polygon[0];
                println!("{} (from {corner})", zone.id);
            }
        }
        App::ClearCache => {
            let navigator = open_navigator(&config, kv, &[])?;
            let removed = navigator.clear_offline_data()?;
            println!("removed {removed} cached routes and the position trail");
        }
    }

    Ok(())
}

fn open_navigator(
    config: &Config,
    kv: Arc<dyn KvStore>,
    block: &[String],
) -> eyre::Result<Navigator<OsrmClient>> {
    let provider = OsrmClient::new(&config.osrm_url, config.provider_timeout)?;
    let mut navigator = Navigator::new(config.clone(), provider, kv, Arc::new(SystemClock));

    navigator.load_zones(sample_haciendas())?;
    for name in block {
        navigator.set_blocked(name, true)?;
        info!("Blocked {name}");
    }
    navigator.sweep_cache();

    Ok(navigator)
}

async fn simulate(
    config: &Config,
    kv: Arc<dyn KvStore>,
    args: &RouteArgs,
    speed_mps: f64,
) -> eyre::Result<()> {
    let navigator = open_navigator(config, kv, &args.block)?;
    if let Some(last) = navigator.last_known_position() {
        info!("Last known position: {}", last.location);
    }

    let set = navigator.compute_route(args.request()).await?;
    print_route_set(&set);
    let route = set.current().ok_or_eyre("no route selected")?.clone();

    let mut events = navigator.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match simd_json::to_string(&event) {
                Ok(json) => println!("{json}"),
                Err(err) => println!("{event:?} ({err})"),
            }
        }
    });

    let session = navigator.begin_tracking()?;
    let mut source =
        ReplaySource::along_route(&route, speed_mps, SystemClock.now(), config.position_interval)
            .playback(SIMULATION_PLAYBACK);
    info!("Replaying {} fixes", source.len());

    let snapshot = navigator.follow(session, &mut source).await?;
    println!(
        "{:.1}% done, {} left, about {:.0} min",
        snapshot.percent,
        format_distance(snapshot.remaining_m),
        snapshot.remaining_time_s / 60.
    );

    // closes the event channel so the printer finishes
    drop(navigator);
    printer
        .await
        .map_err(|e| eyre!("event printer failed: {e}"))?;
    Ok(())
}

fn print_route_set(set: &RouteSet) {
    for (i, route) in set.candidates.iter().enumerate() {
        let marker = if set.selected == Some(i) {
            "*"
        } else if set.valid[i] {
            " "
        } else {
            "x"
        };
        println!("{marker} route {}: {}", i + 1, summarize(route));
    }

    if let Some(route) = set.current() {
        for step in &route.steps {
            println!("    {} ({})", step.text, format_distance(step.distance_m));
        }
    }
}

fn summarize(route: &Route) -> String {
    format!(
        "{}, {:.0} min, {} points",
        format_distance(route.total_distance_m),
        route.total_time_s / 60.,
        route.coordinates.len()
    )
}

fn format_distance(meters: f64) -> String {
    if meters > 1000. {
        format!("{:.1} km", meters / 1000.)
    } else {
        format!("{} m", meters.round())
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition() {
        CliArgs::command().debug_assert();
    }

    #[test]
    fn test_parse_simulate() {
        let args = CliArgs::try_parse_from([
            "hacienda-router",
            "simulate",
            "3.62,-76.30",
            "-3.6,-76.2",
            "--via",
            "3.61,-76.29",
            "--block",
            "Hacienda Providencia",
            "--block",
            "Hacienda San José",
            "--speed",
            "20",
        ])
        .unwrap();

        let App::Simulate { route, speed } = args.app else {
            panic!("expected simulate");
        };
        assert_eq!(speed, 20.);
        assert_eq!(route.destination, Location::new(-3.6, -76.2));
        assert_eq!(route.block.len(), 2);
        assert_eq!(route.request().waypoint, Some(Location::new(3.61, -76.29)));
    }

    #[test]
    fn test_rejects_bad_locations() {
        assert!(CliArgs::try_parse_from(["hacienda-router", "route", "nowhere", "1,2"]).is_err());
        assert!(CliArgs::try_parse_from(["hacienda-router", "route", "1,2"]).is_err());
    }
}
