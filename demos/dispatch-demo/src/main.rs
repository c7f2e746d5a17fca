//! Dispatch demo.
//!
//! Runs one ride end to end against the configured store: a rider and three
//! drivers sign up, an administrator approves the drivers, the rider posts a
//! bid, every driver races to accept it and the winner completes the trip.
//!
//! Uses `PostgreSQL` when `DATABASE_URL` is set and an in-memory store
//! otherwise.

use anyhow::Context;
use futures::StreamExt;
use futures::future::join_all;
use ride_dispatch_core::account::Account;
use ride_dispatch_core::store::RideStore;
use ride_dispatch_core::types::{Actor, Gender, GeoPoint, Location, VehicleCategory};
use ride_dispatch_postgres::PostgresRideStore;
use ride_dispatch_runtime::metrics::MetricsServer;
use ride_dispatch_runtime::{AcceptOutcome, BidRequest, DispatchConfig, DispatchEngine, Registration};
use ride_dispatch_testing::InMemoryRideStore;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const PICKUP: GeoPoint = GeoPoint::new(27.4924, 77.6737);
const DROP: GeoPoint = GeoPoint::new(27.5045, 77.6696);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dispatch_demo=info,ride_dispatch_runtime=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = DispatchConfig::from_env();

    let mut metrics = MetricsServer::new(config.metrics.addr);
    if config.metrics.enabled {
        metrics.start().context("installing metrics recorder")?;
    }

    let store: Arc<dyn RideStore> = match &config.postgres.url {
        Some(url) => {
            info!("Connecting to PostgreSQL");
            let store = PostgresRideStore::new(url, config.postgres.max_connections).await?;
            store.migrate().await?;
            Arc::new(store)
        },
        None => {
            info!("DATABASE_URL not set, using the in-memory store");
            Arc::new(InMemoryRideStore::new())
        },
    };

    let engine = DispatchEngine::builder()
        .config(config)
        .store(store)
        .build()
        .context("building dispatch engine")?;

    let (rider, drivers) = onboard(&engine).await?;

    // First driver watches the pending feed for the whole run.
    let session = engine.open_session(Actor::Driver(drivers[0].id)).await?;
    let mut pending = session.pending_requests().await?;
    let watcher = tokio::spawn(async move {
        while let Some(update) = pending.next().await {
            match update {
                Ok(snapshot) => info!(visible = snapshot.len(), "Pending requests changed"),
                Err(error) => warn!(%error, "Pending feed lost"),
            }
        }
    });

    let quote = engine.estimate(PICKUP, DROP).await?;
    info!(source = ?quote.source, mini = ?quote.get(VehicleCategory::Mini), "Fare quote");

    let rider_actor = Actor::Rider(rider.id);
    let bid = BidRequest::new(
        Location::new(PICKUP, "Mathura Junction"),
        Location::new(DROP, "Vishram Ghat"),
        VehicleCategory::Mini,
        None,
    );
    let ride = engine.propose_bid(&rider_actor, bid).await?;
    info!(ride_id = %ride.id, fare = ride.fare, "Bid posted");

    let ride_id = ride.id;
    let attempts = drivers.iter().map(|driver| {
        let engine = engine.clone();
        let actor = Actor::Driver(driver.id);
        async move { (actor, engine.accept(&actor, ride_id).await) }
    });
    let mut winner = None;
    for (actor, result) in join_all(attempts).await {
        match result? {
            AcceptOutcome::Won(_) => winner = Some(actor),
            AcceptOutcome::Lost { status, winner: holder } => {
                info!(%actor, %status, ?holder, "Lost the race");
            },
        }
    }
    let winner = winner.context("no driver won the request")?;
    info!(%winner, "Won the race");

    engine.mark_arrived(&winner, ride.id).await?;
    engine.start_trip(&winner, ride.id, ride.trip_code.as_str()).await?;
    let finished = engine.end_trip(&winner, ride.id).await?;
    info!(status = %finished.status(), "Trip finished");

    let receipt = engine.rate_driver(&rider_actor, ride.id, 5).await?;
    info!(
        driver_id = %receipt.driver_id,
        rating = receipt.driver_rating,
        ratings = receipt.rating_count,
        "Driver rated"
    );

    if let Some(driver_id) = winner.account_id() {
        let driver = engine.accounts().get(driver_id).await?;
        let ledger = engine.accounts().ledger(&winner, driver_id).await?;
        info!(
            wallet = driver.wallet_balance,
            trips = driver.total_trips,
            entries = ledger.len(),
            "Driver settled"
        );
    }

    session.close();
    watcher.await?;

    if let Some(text) = metrics.render() {
        println!("{text}");
    }
    Ok(())
}

/// Register a rider, an administrator and three approved, online drivers.
async fn onboard(engine: &DispatchEngine) -> anyhow::Result<(Account, Vec<Account>)> {
    let accounts = engine.accounts();

    let rider = accounts.register(Registration::rider("Meera")).await?;
    let admin = accounts.register(Registration::admin("Dispatch Ops")).await?;
    let admin = Actor::Admin(admin.id);

    let mut drivers = Vec::new();
    for (name, offset) in [("Ravi", 0.002), ("Kiran", 0.01), ("Suresh", 0.03)] {
        let driver = accounts
            .register(Registration::driver(name, VehicleCategory::Mini, Gender::Male))
            .await?;
        accounts.set_approval(&admin, driver.id, true, true).await?;

        let actor = Actor::Driver(driver.id);
        accounts
            .update_location(&actor, GeoPoint::new(PICKUP.lat + offset, PICKUP.lng))
            .await?;
        drivers.push(accounts.set_availability(&actor, true).await?);
    }

    info!(rider_id = %rider.id, drivers = drivers.len(), "Accounts ready");
    Ok((rider, drivers))
}
