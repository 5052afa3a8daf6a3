use actix_web::{middleware, web, App, HttpServer};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing_actix_web::TracingLogger;
use tracing_subscriber::EnvFilter;

use invoice_intelligence::api::{configure_routes, ApiState};
use invoice_intelligence::cache::{Cache, LruCache, RedisCache};
use invoice_intelligence::core::{Settings, StorageBackend};
use invoice_intelligence::extraction::{Enhancer, ExtractionOrchestrator, OrchestratorConfig};
use invoice_intelligence::generators::UblGenerator;
use invoice_intelligence::jurisdiction::GstRateTable;
use invoice_intelligence::models::ExtractionResult;
use invoice_intelligence::pipeline::{Pipeline, PipelineDeps};
use invoice_intelligence::providers::build_providers;
use invoice_intelligence::storage::{
    BlobStore, InvoiceLookup, MemoryBlobStore, MemoryRecordStore, PgRecordStore, RecordStore, S3BlobStore,
    TemplateRepository, VendorDirectory,
};
use invoice_intelligence::templates::TemplateMatcher;
use invoice_intelligence::validation::ValidationEngine;

struct Stores {
    records: Arc<dyn RecordStore>,
    lookup: Arc<dyn InvoiceLookup>,
    vendors: Arc<dyn VendorDirectory>,
    templates: Arc<dyn TemplateRepository>,
}

impl Stores {
    fn from<S>(store: Arc<S>) -> Self
    where
        S: RecordStore + InvoiceLookup + VendorDirectory + TemplateRepository + 'static,
    {
        Stores {
            records: store.clone(),
            lookup: store.clone(),
            vendors: store.clone(),
            templates: store,
        }
    }
}

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("Starting invoice pipeline");

    let settings = Settings::load().context("loading configuration")?;
    invoice_intelligence::metrics::init();
    prometheus::default_registry()
        .register(Box::new(prometheus::process_collector::ProcessCollector::for_self()))?;

    let rates = GstRateTable::default();

    let stores = match settings.database.url {
        Some(_) => {
            let pg = PgRecordStore::connect(&settings.database).await?;
            pg.migrate().await?;
            Stores::from(Arc::new(pg))
        }
        None => {
            tracing::warn!("no database configured, using in-memory records");
            Stores::from(Arc::new(MemoryRecordStore::new()))
        }
    };

    let blobs: Arc<dyn BlobStore> = match settings.storage.backend {
        StorageBackend::S3 => Arc::new(S3BlobStore::new(&settings.storage).await),
        StorageBackend::Memory => Arc::new(MemoryBlobStore::new()),
    };

    let extraction = &settings.extraction;
    let cache: Arc<dyn Cache<ExtractionResult>> = match &settings.redis.url {
        Some(url) => Arc::new(RedisCache::connect(url, "extraction", settings.redis.ttl_seconds).await?),
        None => Arc::new(LruCache::new(extraction.cache_capacity)),
    };

    let providers = build_providers(
        &extraction.providers,
        rates.clone(),
        Duration::from_secs(extraction.request_timeout_secs),
    )?;

    let templates = if extraction.template_matching {
        let matcher = Arc::new(TemplateMatcher::new(
            Some(stores.templates.clone()),
            extraction.template_working_set,
        ));
        if let Err(e) = matcher.load().await {
            tracing::warn!(error = %e, "could not load templates, starting with an empty working set");
        }
        Some(matcher)
    } else {
        None
    };

    let orchestrator = ExtractionOrchestrator::new(
        providers,
        templates.clone(),
        Enhancer::new(rates.clone(), Some(stores.vendors.clone()), extraction.name_similarity_threshold),
        cache,
        OrchestratorConfig::from(extraction),
    );
    tracing::info!(sources = ?orchestrator.provider_ids(), "extraction orchestrator ready");
    let validator = Arc::new(ValidationEngine::new(
        rates.clone(),
        settings.validation.clone(),
        Some(stores.lookup.clone()),
    ));

    let deps = PipelineDeps {
        records: stores.records.clone(),
        blobs,
        extractor: Arc::new(orchestrator),
        validator: validator.clone(),
        generator: Arc::new(UblGenerator::new(rates)?),
    };
    let pipeline = Pipeline::new(deps, settings.pipeline.clone(), settings.quota.clone());
    let dispatcher = pipeline.start();

    let state = web::Data::new(ApiState::new(pipeline.clone(), validator, templates, &settings.server));
    let (host, port) = (settings.server.host.clone(), settings.server.port);
    tracing::info!("Starting server on {}:{}", host, port);

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(TracingLogger::default())
            .wrap(middleware::NormalizePath::trim())
            .configure(configure_routes)
    })
    .bind((host.as_str(), port))?
    .run()
    .await?;

    pipeline.shutdown();
    dispatcher.await?;
    tracing::info!("Shut down cleanly");
    Ok(())
}
