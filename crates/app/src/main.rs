use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use docgate_core::{
    cancellation_pair, load_config, Answer, Backends, CharacterNgramEmbedder, Document,
    DocumentListQuery, EmbeddingService, FacetFilters, FileType, FsObjectStore,
    GenerationService, HttpEmbeddingService, HttpGenerationService, HttpRerankService,
    InMemoryFacetIndex, InMemoryVectorIndex, KnowledgeBase, LexicalReranker, LifecycleState,
    ModelServices, OpenSearchStore, PipelineConfig, QdrantStore, RerankService,
    RetrievalRequest, SearchRequest, SearchSort, SortField, SortOrder, SqliteMetadataStore,
    UploadMetadata,
};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Backend {
    /// SQLite + filesystem objects, indices rebuilt in memory on start.
    Local,
    /// SQLite + filesystem objects, Qdrant and OpenSearch indices.
    Remote,
}

#[derive(Parser)]
#[command(name = "docgate", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Pipeline configuration file (TOML)
    #[arg(long, env = "DOCGATE_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "local", env = "DOCGATE_BACKEND")]
    backend: Backend,

    /// Directory for the metadata database and stored uploads
    #[arg(long, default_value = ".docgate", env = "DOCGATE_DATA_DIR")]
    data_dir: PathBuf,

    /// Qdrant base URL
    #[arg(long, default_value = "http://localhost:6333", env = "QDRANT_URL")]
    qdrant_url: String,

    /// Qdrant collection
    #[arg(long, default_value = "docgate_chunks")]
    qdrant_collection: String,

    /// OpenSearch base URL
    #[arg(long, default_value = "http://localhost:9200", env = "OPENSEARCH_URL")]
    opensearch_url: String,

    /// OpenSearch index name
    #[arg(long, default_value = "docgate_documents")]
    opensearch_index: String,
}

#[derive(Subcommand)]
enum Command {
    /// Upload one document. It stays pending until approved.
    Ingest {
        path: PathBuf,
        #[arg(long, default_value = "cli")]
        uploader: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Declared MIME type, otherwise inferred from the file
        #[arg(long)]
        mime: Option<String>,
    },
    /// Upload every supported file under a folder, skipping failures.
    IngestFolder {
        folder: PathBuf,
        #[arg(long, default_value = "cli")]
        uploader: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    Approve {
        document_id: String,
    },
    Reject {
        document_id: String,
    },
    /// Move a rejected document back to review.
    Reopen {
        document_id: String,
    },
    Delete {
        document_id: String,
    },
    /// Rebuild a document's chunks from its stored upload.
    Reprocess {
        document_id: String,
    },
    List {
        #[arg(long, value_parser = parse_state)]
        status: Option<LifecycleState>,
        #[arg(long)]
        uploader: Option<String>,
        #[arg(long, default_value = "20")]
        limit: usize,
        #[arg(long, default_value = "0")]
        offset: usize,
    },
    /// Faceted document search over approved documents.
    Search {
        query: String,
        #[command(flatten)]
        filters: FilterArgs,
        #[arg(long, value_parser = parse_sort_field, default_value = "relevance")]
        sort: SortField,
        #[arg(long, default_value_t = false)]
        ascending: bool,
        #[arg(long, default_value = "1")]
        page: usize,
        #[arg(long, default_value = "20")]
        size: usize,
    },
    /// Retrieve, assemble a cited context and answer. Ctrl-C cancels.
    Ask {
        query: String,
        #[command(flatten)]
        filters: FilterArgs,
        #[arg(long)]
        top_k: Option<usize>,
        /// Print the assembled context as well
        #[arg(long, default_value_t = false)]
        show_context: bool,
    },
    /// Replay index sync for every document.
    Reconcile,
}

#[derive(clap::Args)]
struct FilterArgs {
    #[arg(long, value_parser = parse_file_type)]
    file_type: Option<FileType>,
    #[arg(long = "filter-uploader")]
    uploader: Option<String>,
    #[arg(long = "filter-tag")]
    tags: Vec<String>,
}

impl FilterArgs {
    fn into_filters(self) -> FacetFilters {
        FacetFilters {
            file_type: self.file_type,
            uploader_id: self.uploader,
            tags: self.tags,
            ..Default::default()
        }
    }
}

fn parse_state(value: &str) -> Result<LifecycleState, String> {
    value
        .parse::<LifecycleState>()
        .map_err(|_| format!("unknown status `{value}` (pending_review, active, rejected)"))
}

fn parse_file_type(value: &str) -> Result<FileType, String> {
    FileType::from_extension(value).ok_or_else(|| format!("unknown file type `{value}` (pdf, txt, md)"))
}

fn parse_sort_field(value: &str) -> Result<SortField, String> {
    match value {
        "relevance" | "score" => Ok(SortField::Relevance),
        "uploaded_at" | "date" => Ok(SortField::UploadedAt),
        "filename" => Ok(SortField::Filename),
        "file_size" | "size" => Ok(SortField::FileSize),
        other => Err(format!(
            "unknown sort field `{other}` (relevance, uploaded_at, filename, file_size)"
        )),
    }
}

fn model_services(config: &PipelineConfig) -> anyhow::Result<ModelServices> {
    let services = &config.services;

    let embedding: Arc<dyn EmbeddingService> = match &services.embedding {
        Some(endpoint) => Arc::new(HttpEmbeddingService::new(
            &endpoint.endpoint,
            endpoint.model.clone(),
            endpoint.api_key(),
            endpoint.dimensions.unwrap_or_default(),
        )?),
        None => Arc::new(CharacterNgramEmbedder::default()),
    };
    let reranker: Arc<dyn RerankService> = match &services.rerank {
        Some(endpoint) => Arc::new(HttpRerankService::new(
            &endpoint.endpoint,
            endpoint.model.clone(),
            endpoint.api_key(),
        )?),
        None => Arc::new(LexicalReranker),
    };
    let generator = match &services.generation {
        Some(endpoint) => Some(Arc::new(HttpGenerationService::new(
            &endpoint.endpoint,
            endpoint.model.clone(),
            endpoint.api_key(),
        )?) as Arc<dyn GenerationService>),
        None => None,
    };

    Ok(ModelServices {
        embedding,
        reranker: Some(reranker),
        generator,
    })
}

async fn build(cli: &Cli, config: PipelineConfig) -> anyhow::Result<KnowledgeBase> {
    std::fs::create_dir_all(&cli.data_dir)
        .with_context(|| format!("creating data dir {}", cli.data_dir.display()))?;
    let metadata = Arc::new(SqliteMetadataStore::open(cli.data_dir.join("metadata.sqlite3"))?);
    let objects = Arc::new(FsObjectStore::new(cli.data_dir.join("objects")));
    let models = model_services(&config)?;

    let knowledge_base = match cli.backend {
        Backend::Local => {
            let knowledge_base = KnowledgeBase::new(
                Backends {
                    metadata,
                    objects,
                    vectors: Arc::new(InMemoryVectorIndex::new()),
                    facets: Arc::new(InMemoryFacetIndex::new()),
                },
                models,
                config,
            );
            let report = knowledge_base.reconcile().await?;
            info!(
                documents = report.documents,
                projected = report.projected,
                "local indices rebuilt"
            );
            knowledge_base
        }
        Backend::Remote => {
            let vectors = QdrantStore::new(
                &cli.qdrant_url,
                &cli.qdrant_collection,
                models.embedding.dimensions(),
            );
            vectors.ensure_collection().await?;
            let facets = OpenSearchStore::new(&cli.opensearch_url, &cli.opensearch_index);
            facets.ensure_index().await?;

            KnowledgeBase::new(
                Backends {
                    metadata,
                    objects,
                    vectors: Arc::new(vectors),
                    facets: Arc::new(facets),
                },
                models,
                config,
            )
        }
    };
    Ok(knowledge_base)
}

fn print_document(document: &Document) {
    let flags = match (&document.flags.ingestion_error, document.flags.needs_manual_review) {
        (Some(error), _) => format!(" ingestion_error=\"{error}\""),
        (None, true) => " needs_manual_review".to_string(),
        (None, false) => String::new(),
    };
    println!(
        "{} {} state={} visible={} generation={} uploaded_at={}{}",
        document.document_id,
        document.filename,
        document.state,
        document.visible,
        document.generation,
        document.uploaded_at.to_rfc3339(),
        flags
    );
}

fn print_answer(answer: &Answer, show_context: bool) {
    match &answer.answer {
        Some(text) => println!("{text}\n"),
        None if answer.citations.is_empty() => println!("no approved document matches this question\n"),
        None => println!("(no generated answer)\n"),
    }
    if show_context {
        println!("{}", answer.context);
    }
    for (index, citation) in answer.citations.iter().enumerate() {
        println!("[{}] {} score={:.4}", index + 1, citation.format_inline(), citation.score);
    }
    if answer.degraded {
        for warning in &answer.warnings {
            warn!(warning = ?warning, "degraded answer");
        }
        println!("degraded: {} warning(s)", answer.warnings.len());
    }
}

fn tag_set(tags: Vec<String>) -> BTreeSet<String> {
    tags.into_iter().collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => load_config(path).with_context(|| format!("loading {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    info!(
        version = app_version,
        backend = ?cli.backend,
        started_at = %Utc::now().to_rfc3339(),
        "docgate boot"
    );
    let knowledge_base = build(&cli, config).await?;

    match cli.command {
        Command::Ingest {
            path,
            uploader,
            tags,
            mime,
        } => {
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let filename = path
                .file_name()
                .and_then(|name| name.to_str())
                .context("path has no file name")?
                .to_string();
            let outcome = knowledge_base
                .ingest(
                    &bytes,
                    UploadMetadata {
                        filename,
                        mime_type: mime,
                        uploader_id: uploader,
                        tags: tag_set(tags),
                        metadata: Default::default(),
                    },
                )
                .await?;

            if outcome.reused_existing {
                println!("{} already uploaded", outcome.document_id);
            } else {
                println!(
                    "{} ingested: generation={} chunks={} redactions={}{}",
                    outcome.document_id,
                    outcome.generation,
                    outcome.chunk_count,
                    outcome.redactions.len(),
                    if outcome.needs_manual_review { " needs_manual_review" } else { "" }
                );
            }
        }
        Command::IngestFolder {
            folder,
            uploader,
            tags,
        } => {
            let report = knowledge_base
                .ingest_folder(&folder, &uploader, &tag_set(tags))
                .await?;
            for skipped in &report.skipped {
                warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped document");
            }
            for outcome in &report.ingested {
                println!("{} chunks={}", outcome.document_id, outcome.chunk_count);
            }
            println!(
                "{} document(s) ingested, {} skipped at {}",
                report.ingested.len(),
                report.skipped.len(),
                Utc::now().to_rfc3339()
            );
        }
        Command::Approve { document_id } => print_document(&knowledge_base.approve(&document_id).await?),
        Command::Reject { document_id } => print_document(&knowledge_base.reject(&document_id).await?),
        Command::Reopen { document_id } => print_document(&knowledge_base.reopen(&document_id).await?),
        Command::Delete { document_id } => {
            if knowledge_base.delete(&document_id).await? {
                println!("{document_id} deleted");
            } else {
                println!("{document_id} not found");
            }
        }
        Command::Reprocess { document_id } => {
            let outcome = knowledge_base.reprocess(&document_id).await?;
            println!(
                "{} reprocessed: generation={} chunks={}",
                outcome.document_id, outcome.generation, outcome.chunk_count
            );
        }
        Command::List {
            status,
            uploader,
            limit,
            offset,
        } => {
            let page = knowledge_base
                .list_documents(&DocumentListQuery {
                    status,
                    uploader_id: uploader,
                    limit,
                    offset,
                })
                .await?;
            for document in &page.documents {
                print_document(document);
            }
            println!("{} of {} document(s)", page.documents.len(), page.total);
        }
        Command::Search {
            query,
            filters,
            sort,
            ascending,
            page,
            size,
        } => {
            let response = knowledge_base
                .search(&SearchRequest {
                    query,
                    filters: filters.into_filters(),
                    sort: SearchSort {
                        field: sort,
                        order: if ascending { SortOrder::Asc } else { SortOrder::Desc },
                    },
                    page,
                    size,
                })
                .await?;

            for hit in &response.hits {
                println!(
                    "score={:.3} {} {} type={} uploader={} size={}",
                    hit.score, hit.document_id, hit.filename, hit.file_type, hit.uploader_id, hit.file_size
                );
            }
            println!(
                "page {} ({} per page), {} total",
                response.page, response.size, response.total
            );
            for (name, counts) in [
                ("file_type", &response.facets.file_types),
                ("uploader", &response.facets.uploaders),
                ("tag", &response.facets.tags),
                ("month", &response.facets.upload_months),
            ] {
                if counts.is_empty() {
                    continue;
                }
                let rendered: Vec<String> = counts
                    .iter()
                    .map(|count| format!("{}={}", count.key, count.count))
                    .collect();
                println!("facet {name}: {}", rendered.join(" "));
            }
        }
        Command::Ask {
            query,
            filters,
            top_k,
            show_context,
        } => {
            let request = RetrievalRequest {
                query,
                filters: filters.into_filters(),
                top_k: top_k.unwrap_or(knowledge_base.config().retrieval.top_k),
            };
            let (handle, token) = cancellation_pair();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    handle.cancel();
                }
            });

            let answer = knowledge_base.ask_with(&request, &token).await?;
            print_answer(&answer, show_context);
        }
        Command::Reconcile => {
            let report = knowledge_base.reconcile().await?;
            for (document_id, reason) in &report.failures {
                warn!(document_id = %document_id, reason = %reason, "reconcile failure");
            }
            println!(
                "{} document(s): {} projected, {} retracted, {} failed",
                report.documents,
                report.projected,
                report.retracted,
                report.failures.len()
            );
        }
    }

    Ok(())
}
