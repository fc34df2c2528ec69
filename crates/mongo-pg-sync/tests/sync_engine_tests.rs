//! End-to-end engine tests against the in-memory store and warehouse.

use std::sync::Arc;
use std::time::Duration;

use bson::{doc, Document};
use mongo_pg_sync::core::{Backoff, RetryPolicy, SqlValue};
use mongo_pg_sync::listener::ListenerState;
use mongo_pg_sync::warehouse::{MemoryConnectionManager, StoredRow};
use mongo_pg_sync::{
    EngineSettings, EngineState, EntityType, MemorySource, MemoryWarehouse, RunOutcome, RunState,
    SyncEngine, SyncError, SyncTrigger,
};

const WAIT: Duration = Duration::from_secs(10);

type Engine = SyncEngine<MemoryConnectionManager>;

fn settings(warm_up: bool) -> EngineSettings {
    let mut settings = EngineSettings::default();
    settings.warm_up_on_start = warm_up;
    settings.pool.min_size = 1;
    settings.pool.max_size = 3;
    settings.pool.acquire_timeout = Duration::from_secs(1);
    settings.pool.shutdown_grace = Duration::from_secs(2);
    settings.retry = RetryPolicy::immediate(3);
    settings.listener.backoff =
        Backoff::exponential(Duration::from_millis(5), Duration::from_millis(20)).with_full_jitter();
    settings.listener.max_consecutive_failures = 3;
    settings.listener.stop_timeout = Duration::from_secs(2);
    settings.orchestrator.retry_failed_after = None;
    settings.orchestrator.join_timeout = Duration::from_secs(5);
    settings
}

fn sale(id: &str, customer: &str, agent: &str, status: &str, amount: f64) -> Document {
    doc! {
        "_id": id,
        "clienteId": customer,
        "agenteId": agent,
        "estadoVenta": status,
        "montoTotal": amount,
        "fechaVenta": "2024-03-15T10:30:00Z",
        "puntuacionSatisfaccion": 4,
    }
}

/// A small travel agency: 3 customers, 2 agents, 10 sales and their lines and payments.
fn seeded_source() -> MemorySource {
    let source = MemorySource::default();
    for (id, first, last) in [("cli_1", "Ana", "Pérez"), ("cli_2", "Jorge", "Díaz"), ("cli_3", "Lucía", "Mora")] {
        source.upsert(
            EntityType::Customer,
            doc! {
                "_id": id,
                "usuarioId": format!("usr_{}", id),
                "usuario": { "nombre": first, "apellido": last, "email": format!("{}@example.com", id) },
                "fechaRegistro": "2023-11-02",
            },
        );
    }
    for (id, name) in [("age_1", "Luis"), ("age_2", "Marta")] {
        source.upsert(EntityType::Agent, doc! { "_id": id, "nombre": name });
    }
    source.upsert(
        EntityType::Service,
        doc! { "_id": "srv_1", "destinoCiudad": "Cusco", "destinoPais": "Perú", "precioCosto": 120.0 },
    );
    source.upsert(
        EntityType::Package,
        doc! { "_id": "paq_1", "destinoPrincipal": "Machu Picchu", "precioTotalVenta": 950 },
    );
    for n in 1..=10 {
        let id = format!("venta_{:03}", n);
        let status = if n == 9 { "cancelada" } else { "pagada" };
        let customer = format!("cli_{}", (n % 3) + 1);
        let agent = format!("age_{}", (n % 2) + 1);
        source.upsert(EntityType::Sale, sale(&id, &customer, &agent, status, 100.0 * n as f64));
        source.upsert(
            EntityType::SaleLine,
            doc! { "_id": format!("det_{:03}", n), "ventaId": id.as_str(), "servicioId": "srv_1", "cantidad": 2, "precioUnitario": 50 },
        );
        source.upsert(
            EntityType::Payment,
            doc! { "_id": format!("pago_{:03}", n), "ventaId": id.as_str(), "monto": 100, "metodoPago": "tarjeta", "estado": "completado" },
        );
    }
    source
}

async fn start(source: &MemorySource, warehouse: &MemoryWarehouse, settings: EngineSettings) -> Engine {
    SyncEngine::start(
        settings,
        warehouse.manager(),
        Arc::new(source.clone()),
        Arc::new(source.clone()),
    )
    .await
    .unwrap()
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_listener(engine: &Engine, state: ListenerState) {
    wait_until("listener state", || engine.status().listener.state == state).await;
}

fn snapshot(warehouse: &MemoryWarehouse) -> Vec<Vec<(String, StoredRow)>> {
    EntityType::ALL.iter().map(|e| warehouse.rows(*e)).collect()
}

fn sale_status(warehouse: &MemoryWarehouse, id: &str) -> Option<SqlValue> {
    warehouse
        .row(EntityType::Sale, id)
        .and_then(|row| row.get(EntityType::Sale, "estado").cloned())
}

#[tokio::test]
async fn test_repeated_pass_is_idempotent() {
    let source = seeded_source();
    let warehouse = MemoryWarehouse::new();
    let engine = start(&source, &warehouse, settings(true)).await;

    let first = engine.wait_for_passes(1, WAIT).await.unwrap();
    assert!(first.last_run.as_ref().unwrap().succeeded());
    let before = snapshot(&warehouse);
    assert_eq!(warehouse.count(EntityType::Sale), 10);

    assert!(engine.trigger_sync());
    let second = engine.wait_for_passes(2, WAIT).await.unwrap();
    let run = second.last_run.unwrap();

    assert_eq!(run.trigger, SyncTrigger::Manual);
    assert_eq!(run.totals().inserted, 0);
    assert_eq!(run.totals().updated, 0);
    assert_eq!(run.totals().unchanged, first.last_run.unwrap().totals().inserted);
    assert_eq!(snapshot(&warehouse), before);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_burst_of_notifications_runs_two_passes() {
    let source = seeded_source();
    let warehouse = MemoryWarehouse::new();
    let engine = start(&source, &warehouse, settings(false)).await;
    wait_for_listener(&engine, ListenerState::Watching).await;

    // Make the first pass slow enough that the burst lands while it runs
    source.set_fetch_delay(Duration::from_millis(40));
    assert!(engine.trigger_sync());
    wait_until("pass running", || engine.status().orchestrator.state == RunState::Running).await;

    for n in 11..=15 {
        source.upsert(
            EntityType::Sale,
            sale(&format!("venta_{:03}", n), "cli_1", "age_1", "pendiente", 10.0),
        );
    }

    let status = engine.wait_for_passes(2, WAIT).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    let status_after = engine.status().orchestrator;

    assert_eq!(status_after.passes_started, 2);
    assert_eq!(status.coalesced_requests, 4);
    let run = status.last_run.unwrap();
    assert!(matches!(run.trigger, SyncTrigger::Change { .. }));
    assert_eq!(run.coalesced, 4);
    assert_eq!(warehouse.count(EntityType::Sale), 15);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_status_change_updates_row_in_place() {
    let source = seeded_source();
    let warehouse = MemoryWarehouse::new();
    let engine = start(&source, &warehouse, settings(true)).await;
    wait_for_listener(&engine, ListenerState::Watching).await;
    engine.wait_for_passes(1, WAIT).await.unwrap();

    assert_eq!(sale_status(&warehouse, "venta_009"), Some(SqlValue::String("cancelada".into())));
    let id_before = warehouse.id_of(EntityType::Sale, "venta_009");
    let count_before = warehouse.count(EntityType::Sale);

    assert!(source.set_field(EntityType::Sale, "venta_009", "estadoVenta", "confirmada"));
    let status = engine.wait_for_passes(2, WAIT).await.unwrap();

    assert_eq!(sale_status(&warehouse, "venta_009"), Some(SqlValue::String("confirmada".into())));
    assert_eq!(warehouse.id_of(EntityType::Sale, "venta_009"), id_before);
    assert_eq!(warehouse.count(EntityType::Sale), count_before);

    let run = status.last_run.unwrap();
    assert_eq!(
        run.trigger,
        SyncTrigger::Change {
            collection: Some("ventas".into()),
            operation: mongo_pg_sync::source::OperationKind::Update,
        }
    );
    let sales = run.entities.iter().find(|r| r.entity == EntityType::Sale).unwrap();
    assert_eq!(sales.counts.updated, 1);
    assert_eq!(sales.counts.unchanged, 9);
    assert_eq!(sales.counts.inserted, 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_references_resolve_in_dependency_order() {
    let source = seeded_source();
    let warehouse = MemoryWarehouse::new();
    let engine = start(&source, &warehouse, settings(true)).await;
    engine.wait_for_passes(1, WAIT).await.unwrap();

    for (_, row) in warehouse.rows(EntityType::Sale) {
        assert!(!row.get(EntityType::Sale, "cliente_id").unwrap().is_null());
        assert!(!row.get(EntityType::Sale, "agente_id").unwrap().is_null());
    }
    for (_, row) in warehouse.rows(EntityType::SaleLine) {
        assert!(!row.get(EntityType::SaleLine, "venta_id").unwrap().is_null());
        assert!(!row.get(EntityType::SaleLine, "servicio_id").unwrap().is_null());
    }
    for (_, row) in warehouse.rows(EntityType::Payment) {
        assert!(!row.get(EntityType::Payment, "venta_id").unwrap().is_null());
    }

    let committed: Vec<EntityType> = warehouse.commits().iter().map(|c| c.entity).collect();
    assert_eq!(committed, EntityType::ALL.to_vec());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_acquire_fails_after_shutdown() {
    let source = seeded_source();
    let warehouse = MemoryWarehouse::new();
    let engine = start(&source, &warehouse, settings(true)).await;
    engine.wait_for_passes(1, WAIT).await.unwrap();

    engine.shutdown().await;

    for _ in 0..3 {
        assert!(matches!(engine.pool().acquire().await, Err(SyncError::PoolClosed)));
    }
    assert_eq!(warehouse.open_connections(), 0);
    assert!(!engine.trigger_sync());
}

#[tokio::test]
async fn test_shutdown_mid_pass_stops_at_entity_boundary() {
    let source = seeded_source();
    let warehouse = MemoryWarehouse::new();
    source.set_fetch_delay(Duration::from_millis(500));
    let engine = start(&source, &warehouse, settings(true)).await;

    wait_until("warm-up running", || engine.status().orchestrator.state == RunState::Running).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    engine.restart_listener().await.unwrap();
    engine.shutdown().await;

    let commits_at_shutdown = warehouse.commits().len();
    let status = engine.status();
    let run = status.orchestrator.last_run.unwrap();
    assert_eq!(run.outcome, Some(RunOutcome::Superseded));
    assert!(run.entities.len() < EntityType::ALL.len());
    assert_eq!(run.entities.len(), commits_at_shutdown);
    assert_eq!(status.pool.checked_out, 0);
    assert!(!status.pool.initialized);

    // Nothing touches the warehouse once shutdown has returned
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(warehouse.commits().len(), commits_at_shutdown);
    assert_eq!(warehouse.open_connections(), 0);
}

#[tokio::test]
async fn test_restart_listener_keeps_triggering() {
    let source = seeded_source();
    let warehouse = MemoryWarehouse::new();
    let engine = start(&source, &warehouse, settings(false)).await;
    wait_for_listener(&engine, ListenerState::Watching).await;

    engine.restart_listener().await.unwrap();
    wait_for_listener(&engine, ListenerState::Watching).await;
    assert_eq!(source.subscription_count(), 2);
    assert_eq!(source.open_streams(), 1);
    assert!(engine.status().pool.initialized);

    source.upsert(EntityType::Agent, doc! { "_id": "age_3", "nombre": "Rosa" });
    engine.wait_for_passes(1, WAIT).await.unwrap();
    assert_eq!(warehouse.count(EntityType::Agent), 3);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_listener_failure_is_reported_and_recoverable() {
    let source = seeded_source();
    source.fail_next_subscriptions(50);
    let warehouse = MemoryWarehouse::new();
    let engine = start(&source, &warehouse, settings(false)).await;

    wait_until("engine error", || engine.status().state == EngineState::Error).await;
    let status = engine.status();
    assert_eq!(status.listener.consecutive_failures, 3);
    assert!(status.last_error.is_some());

    // Manual triggers still work while the feed is down
    assert!(engine.trigger_sync());
    engine.wait_for_passes(1, WAIT).await.unwrap();

    source.fail_next_subscriptions(0);
    engine.restart_listener().await.unwrap();
    wait_for_listener(&engine, ListenerState::Watching).await;
    assert_eq!(engine.status().state, EngineState::Idle);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_transient_load_failure_is_retried() {
    let source = seeded_source();
    let warehouse = MemoryWarehouse::new();
    warehouse.fail_next_batches(1);
    let engine = start(&source, &warehouse, settings(true)).await;

    let status = engine.wait_for_passes(1, WAIT).await.unwrap();
    let run = status.last_run.unwrap();
    assert!(run.succeeded());
    assert_eq!(run.entities[0].attempts, 2);
    assert_eq!(warehouse.count(EntityType::Customer), 3);
    assert_eq!(engine.status().pool.checked_out, 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_malformed_documents_do_not_abort_the_batch() {
    let source = seeded_source();
    source.upsert(EntityType::Sale, doc! { "_id": "venta_bad", "estadoVenta": "pagada" });
    source.upsert(EntityType::SaleLine, doc! { "_id": "det_bad", "cantidad": 1 });
    let warehouse = MemoryWarehouse::new();
    let engine = start(&source, &warehouse, settings(true)).await;

    let status = engine.wait_for_passes(1, WAIT).await.unwrap();
    let run = status.last_run.unwrap();
    assert!(run.succeeded());
    assert_eq!(run.skipped(), 2);
    assert_eq!(warehouse.count(EntityType::Sale), 10);
    assert!(warehouse.row(EntityType::Sale, "venta_bad").is_none());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_failed_pass_recovers_on_next_trigger() {
    let source = seeded_source();
    let warehouse = MemoryWarehouse::new();
    warehouse.reject_next_batches(1);
    let engine = start(&source, &warehouse, settings(true)).await;

    let status = engine.wait_for_passes(1, WAIT).await.unwrap();
    assert_eq!(status.passes_failed, 1);
    assert_eq!(status.state, RunState::Idle);
    let engine_status = engine.status();
    assert_eq!(engine_status.state, EngineState::Idle);
    assert!(engine_status.last_error.unwrap().contains("customer"));

    assert!(engine.trigger_sync());
    let status = engine.wait_for_passes(2, WAIT).await.unwrap();
    assert_eq!(status.passes_succeeded, 1);
    assert!(engine.status().last_error.is_none());
    assert_eq!(warehouse.count(EntityType::Payment), 10);

    engine.shutdown().await;
}
