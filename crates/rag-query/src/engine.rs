//! Pipeline orchestrator.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rag_core::{
    ConfidenceScorer, Decision, FusionMethod, Generator, IterationRecord, KeywordIndex, Mode,
    PipelineTrace, Query, QueryRewriter, RagConfig, RagError, RankedResult, Reranker, Result,
    RewrittenQuery, RunOptions, Strategy, StrategyClassifier, VectorIndex,
};

use crate::fusion::{contributing_sources, fuse, rerank, truncate_fused};
use crate::refine::{clamp_confidence, HeuristicConfidence, LoopState, RefineLoop};
use crate::retrieve::{fan_out, KeywordRetriever, Retriever, VectorRetriever};
use crate::strategy::HeuristicSelector;
use crate::trace::{Emitter, EventSink};
use crate::transform::{QueryTransformer, TransformMode};

/// Result of a pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutput {
    pub query: Query,

    /// Strategy the run ended with (auto runs may escalate to `self_refine`).
    pub strategy: Strategy,

    /// Final ranked context.
    pub context: Vec<RankedResult>,

    /// Self-refinement passes, empty for single-pass runs.
    pub iterations: Vec<IterationRecord>,

    /// Every retrieval query issued, across all passes. Each candidate's
    /// `origin_query_id` refers to one of these.
    pub rewrites: Vec<RewrittenQuery>,

    /// Generated answer, when a generator is configured and succeeded.
    pub answer: Option<String>,

    pub trace: PipelineTrace,
}

/// How a pass derives its retrieval queries.
#[derive(Debug, Clone, Copy)]
enum Derivation {
    Mode(TransformMode),
    Reformulate(u32),
}

impl std::fmt::Display for Derivation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mode(mode) => write!(f, "{}", mode),
            Self::Reformulate(pass) => write!(f, "reformulate(pass {})", pass),
        }
    }
}

/// Ranked results of one retrieval pass.
struct Pass {
    results: Vec<RankedResult>,
    list_count: usize,
}

struct Execution {
    strategy: Strategy,
    context: Vec<RankedResult>,
    iterations: Vec<IterationRecord>,
    rewrites: Vec<RewrittenQuery>,
    answer: Option<String>,
}

/// Retrieval-and-ranking pipeline.
///
/// Holds only read-only configuration and collaborators, so one instance can
/// serve concurrent runs.
pub struct Pipeline {
    config: RagConfig,
    vector: Arc<dyn Retriever>,
    keyword: Option<Arc<dyn Retriever>>,
    transformer: QueryTransformer,
    selector: Arc<dyn StrategyClassifier>,
    scorer: Arc<dyn ConfidenceScorer>,
    reranker: Option<Arc<dyn Reranker>>,
    generator: Option<Arc<dyn Generator>>,
}

/// Builder for [`Pipeline`].
pub struct PipelineBuilder {
    config: RagConfig,
    vector: Arc<dyn Retriever>,
    keyword: Option<Arc<dyn Retriever>>,
    rewriter: Option<Arc<dyn QueryRewriter>>,
    selector: Option<Arc<dyn StrategyClassifier>>,
    scorer: Option<Arc<dyn ConfidenceScorer>>,
    reranker: Option<Arc<dyn Reranker>>,
    generator: Option<Arc<dyn Generator>>,
}

impl PipelineBuilder {
    pub fn new(config: RagConfig, vector_index: Arc<dyn VectorIndex>) -> Self {
        let preview_chars = config.retrieval.preview_chars;
        Self {
            config,
            vector: Arc::new(VectorRetriever::new(vector_index, preview_chars)),
            keyword: None,
            rewriter: None,
            selector: None,
            scorer: None,
            reranker: None,
            generator: None,
        }
    }

    /// Enable hybrid retrieval with a keyword index.
    pub fn keyword_index(mut self, index: Arc<dyn KeywordIndex>) -> Self {
        let preview_chars = self.config.retrieval.preview_chars;
        self.keyword = Some(Arc::new(KeywordRetriever::new(index, preview_chars)));
        self
    }

    /// Replace the vector retriever.
    pub fn vector_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.vector = retriever;
        self
    }

    /// Replace the keyword retriever.
    pub fn keyword_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.keyword = Some(retriever);
        self
    }

    pub fn rewriter(mut self, rewriter: Arc<dyn QueryRewriter>) -> Self {
        self.rewriter = Some(rewriter);
        self
    }

    /// Delegate strategy selection, e.g. to an external classifier.
    pub fn selector(mut self, selector: Arc<dyn StrategyClassifier>) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn scorer(mut self, scorer: Arc<dyn ConfidenceScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn build(self) -> Pipeline {
        let selector = self
            .selector
            .unwrap_or_else(|| Arc::new(HeuristicSelector::new(self.config.strategy.clone())));
        let scorer = self
            .scorer
            .unwrap_or_else(|| Arc::new(HeuristicConfidence::default()));
        let transformer = QueryTransformer::new(self.rewriter, self.config.transform.clone());

        Pipeline {
            config: self.config,
            vector: self.vector,
            keyword: self.keyword,
            transformer,
            selector,
            scorer,
            reranker: self.reranker,
            generator: self.generator,
        }
    }
}

impl Pipeline {
    /// Start building a pipeline around a vector index.
    pub fn builder(config: RagConfig, vector_index: Arc<dyn VectorIndex>) -> PipelineBuilder {
        PipelineBuilder::new(config, vector_index)
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    /// Run the pipeline for one query.
    pub async fn run(&self, query_text: &str, options: &RunOptions) -> Result<PipelineOutput> {
        self.run_with(query_text, options, &CancellationToken::new(), None)
            .await
    }

    /// Run the pipeline with a cancellation token and an optional event sink.
    ///
    /// On cancellation in-flight backend calls are dropped, no further passes
    /// start, and partial results are discarded.
    pub async fn run_with(
        &self,
        query_text: &str,
        options: &RunOptions,
        cancel: &CancellationToken,
        sink: Option<Arc<dyn EventSink>>,
    ) -> Result<PipelineOutput> {
        self.config.validate()?;
        options.validate(&self.config)?;
        if query_text.trim().is_empty() {
            return Err(RagError::invalid_argument("query text is empty"));
        }
        if cancel.is_cancelled() {
            return Err(RagError::Cancelled);
        }

        let query = Query::new(query_text);
        let emitter = Emitter::new(query.id, sink, options.debug);

        info!("Running pipeline for: {:?}", query.raw_text);

        let execution = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Pipeline run {} cancelled", query.id);
                return Err(RagError::Cancelled);
            }
            execution = self.execute(&query, options, &emitter) => execution?,
        };

        emitter.debug_timing();
        let latency_ms = emitter.elapsed().as_millis();
        let trace = emitter.finish();

        info!(
            "Pipeline completed in {}ms with {} result(s) via {}",
            latency_ms,
            execution.context.len(),
            execution.strategy
        );

        Ok(PipelineOutput {
            query,
            strategy: execution.strategy,
            context: execution.context,
            iterations: execution.iterations,
            rewrites: execution.rewrites,
            answer: execution.answer,
            trace,
        })
    }

    async fn execute(
        &self,
        query: &Query,
        options: &RunOptions,
        emitter: &Emitter,
    ) -> Result<Execution> {
        let stage = emitter.begin("strategy");
        let strategy = match options.mode.strategy() {
            Some(strategy) => strategy,
            None => self.selector.select(query, &[]),
        };
        emitter.end(
            stage,
            json!({
                "mode": options.mode,
                "strategy": strategy,
                "tokens": query.token_count(),
            }),
            Vec::new(),
        );
        debug!("Selected {} strategy for mode {:?}", strategy, options.mode);

        let mut rewrites = Vec::new();
        let (strategy, context, iterations) = match strategy {
            Strategy::SelfRefine => {
                let refine = self.new_loop(options);
                let (context, iterations) = self
                    .refine(query, options, refine, &mut rewrites, emitter)
                    .await?;
                (strategy, context, iterations)
            }
            single => {
                self.single_pass(query, options, single, &mut rewrites, emitter)
                    .await?
            }
        };

        let answer = self.generate(query, &context, emitter).await;

        Ok(Execution {
            strategy,
            context,
            iterations,
            rewrites,
            answer,
        })
    }

    /// One retrieval pass for `vector_only`, `hybrid` or `decomposed`. In auto
    /// mode a low-confidence pass may escalate into a refinement loop.
    async fn single_pass(
        &self,
        query: &Query,
        options: &RunOptions,
        strategy: Strategy,
        rewrites: &mut Vec<RewrittenQuery>,
        emitter: &Emitter,
    ) -> Result<(Strategy, Vec<RankedResult>, Vec<IterationRecord>)> {
        let mode = match strategy {
            Strategy::Decomposed => TransformMode::Decompose,
            _ => TransformMode::Passthrough,
        };
        let queries = self
            .transform(query, strategy, None, Derivation::Mode(mode), emitter)
            .await?;
        let pass = self
            .retrieve(query, strategy, None, &queries, options.top_k, emitter)
            .await;
        rewrites.extend(queries);
        let pass = pass?;

        if options.mode != Mode::Auto || options.max_iterations < 2 {
            return Ok((strategy, pass.results, Vec::new()));
        }

        let mut refine = self.new_loop(options);
        refine.next_pass();
        let confidence = clamp_confidence(self.scorer.score(&pass.results, pass.list_count));
        let decision = refine.assess(pass.results, confidence)?;
        emitter.emit(
            "assess",
            json!({ "iteration": 0, "confidence": confidence, "decision": decision }),
        );

        let escalate = decision == Decision::RetrieveAgain
            && self.selector.select(query, refine.records()) == Strategy::SelfRefine;
        if !escalate {
            let context = refine
                .into_records()
                .pop()
                .map(|record| record.ranked_results)
                .unwrap_or_default();
            return Ok((strategy, context, Vec::new()));
        }

        info!(
            "Escalating from {} to self-refinement at confidence {:.3}",
            strategy, confidence
        );
        emitter.emit(
            "strategy",
            json!({
                "mode": options.mode,
                "strategy": Strategy::SelfRefine,
                "escalated_from": strategy,
            }),
        );
        let (context, iterations) = self
            .refine(query, options, refine, rewrites, emitter)
            .await?;
        Ok((Strategy::SelfRefine, context, iterations))
    }

    fn new_loop(&self, options: &RunOptions) -> RefineLoop {
        RefineLoop::new(
            options.max_iterations,
            options.confidence_threshold,
            self.config.refine.confidence_floor,
        )
    }

    /// Drive the refinement loop to a terminal state and pick the returned pass.
    async fn refine(
        &self,
        query: &Query,
        options: &RunOptions,
        mut refine: RefineLoop,
        rewrites: &mut Vec<RewrittenQuery>,
        emitter: &Emitter,
    ) -> Result<(Vec<RankedResult>, Vec<IterationRecord>)> {
        while let Some(iteration) = refine.next_pass() {
            let derivation = if iteration == 0 {
                Derivation::Mode(TransformMode::Rewrite)
            } else {
                Derivation::Reformulate(iteration)
            };
            let queries = self
                .transform(query, Strategy::SelfRefine, Some(iteration), derivation, emitter)
                .await?;

            let fetch_k = self.fetch_k(options.top_k, iteration);
            let pass = self
                .retrieve(query, Strategy::SelfRefine, Some(iteration), &queries, fetch_k, emitter)
                .await;
            rewrites.extend(queries);
            let pass = pass?;

            let confidence = clamp_confidence(self.scorer.score(&pass.results, pass.list_count));
            let decision = refine.assess(pass.results, confidence)?;
            emitter.emit(
                "assess",
                json!({
                    "iteration": iteration,
                    "fetch_k": fetch_k,
                    "confidence": confidence,
                    "decision": decision,
                }),
            );
        }

        let selected = refine.selected().map(|r| r.iteration_index);
        let mut annotations = Vec::new();
        if refine.state() == LoopState::BudgetExhausted {
            info!(
                "Refinement budget exhausted after {} pass(es), using pass {:?}",
                refine.records().len(),
                selected
            );
            annotations.push(format!(
                "budget exhausted; returning best pass {}",
                selected.unwrap_or(0)
            ));
        }
        let stage = emitter.begin("refine");
        emitter.end(
            stage,
            json!({
                "passes": refine.records().len(),
                "accepted": refine.state() == LoopState::Accepted,
                "selected_iteration": selected,
            }),
            annotations,
        );

        let context = refine
            .selected()
            .map(|record| record.ranked_results.clone())
            .unwrap_or_default();
        Ok((context, refine.into_records()))
    }

    /// Fetch size for a pass: grows with the pass index, capped at `max_top_k`.
    fn fetch_k(&self, top_k: usize, iteration: u32) -> usize {
        let growth = top_k as f32 * self.config.refine.top_k_growth * iteration as f32;
        (top_k + growth.round() as usize).min(self.config.retrieval.max_top_k)
    }

    /// Derive retrieval queries, falling back to passthrough if the rewriter
    /// is unavailable.
    async fn transform(
        &self,
        query: &Query,
        strategy: Strategy,
        iteration: Option<u32>,
        derivation: Derivation,
        emitter: &Emitter,
    ) -> Result<Vec<RewrittenQuery>> {
        let stage = emitter.begin("transform");
        let outcome = match derivation {
            Derivation::Mode(mode) => self.transformer.transform(query, mode).await,
            Derivation::Reformulate(pass) => self.transformer.reformulate(query, pass).await,
        };

        let (queries, annotations) = match outcome {
            Ok(queries) => (queries, Vec::new()),
            Err(e) if !e.is_recoverable() => {
                emitter.end(stage, json!({ "iteration": iteration }), vec![e.to_string()]);
                return Err(e);
            }
            Err(e) => {
                warn!("Query transform failed, using passthrough: {}", e);
                (
                    vec![RewrittenQuery::passthrough(query)],
                    vec![format!("{}; fell back to passthrough", e)],
                )
            }
        };

        emitter.end(
            stage,
            json!({
                "iteration": iteration,
                "derivation": derivation.to_string(),
                "queries": queries
                    .iter()
                    .map(|q| json!({
                        "id": q.id,
                        "text": q.text,
                        "kind": q.kind,
                        "sequence_index": q.sequence_index,
                    }))
                    .collect::<Vec<_>>(),
            }),
            annotations,
        );
        emitter.debug_query(&query.raw_text, strategy, iteration, &queries);
        Ok(queries)
    }

    /// Retrievers active for a strategy. The vector backend always runs.
    fn active_backends(&self, strategy: Strategy) -> Vec<Arc<dyn Retriever>> {
        let mut backends = vec![self.vector.clone()];
        if strategy.uses_keyword() && self.config.retrieval.hybrid {
            if let Some(keyword) = &self.keyword {
                backends.push(keyword.clone());
            }
        }
        backends
    }

    /// Fan out, fuse, and optionally rerank.
    async fn retrieve(
        &self,
        query: &Query,
        strategy: Strategy,
        iteration: Option<u32>,
        queries: &[RewrittenQuery],
        fetch_k: usize,
        emitter: &Emitter,
    ) -> Result<Pass> {
        let backends = self.active_backends(strategy);
        let fan = fan_out(
            &backends,
            queries,
            fetch_k,
            self.config.retrieval.backend_timeout(),
            emitter,
        )
        .await;

        if fan.all_failed() {
            warn!("All {} backend call(s) failed", fan.failures.len());
        }
        let fan = fan.into_result()?;

        let fusion = &self.config.fusion;
        let pool = match fusion.method {
            FusionMethod::NormalizeSum => fusion.max_results,
            FusionMethod::Rerank => fusion.rerank_candidates.max(fusion.max_results),
        };

        let stage = emitter.begin("fusion");
        let fused = fuse(&fan.lists, pool);
        let candidates: usize = fan.lists.iter().map(|l| l.candidates.len()).sum();
        let annotations = fan
            .failures
            .iter()
            .map(|f| format!("partial results without {}", f))
            .collect();
        emitter.end(
            stage,
            json!({
                "iteration": iteration,
                "method": fusion.method,
                "lists": fan.lists.len(),
                "candidates": candidates,
                "results": fused.len(),
                "sources": contributing_sources(&fused),
            }),
            annotations,
        );
        debug!(
            "Fused {} candidate(s) from {} list(s) into {}",
            candidates,
            fan.lists.len(),
            fused.len()
        );

        let results = match fusion.method {
            FusionMethod::NormalizeSum => truncate_fused(fused, fusion.max_results),
            FusionMethod::Rerank => self.rerank(query, fused, emitter).await,
        };
        emitter.debug_chunks(iteration, &results);

        Ok(Pass {
            results,
            list_count: fan.lists.len(),
        })
    }

    /// Rerank fused results, keeping fusion order if the reranker is missing
    /// or fails.
    async fn rerank(
        &self,
        query: &Query,
        fused: Vec<RankedResult>,
        emitter: &Emitter,
    ) -> Vec<RankedResult> {
        let max_results = self.config.fusion.max_results;
        let stage = emitter.begin("rerank");

        let Some(reranker) = &self.reranker else {
            emitter.end(
                stage,
                json!({ "applied": false }),
                vec!["no reranker configured; using fusion order".to_string()],
            );
            return truncate_fused(fused, max_results);
        };

        match rerank(reranker.as_ref(), &query.raw_text, fused.clone(), max_results).await {
            Ok(results) => {
                emitter.end(
                    stage,
                    json!({ "applied": true, "results": results.len() }),
                    Vec::new(),
                );
                results
            }
            Err(e) => {
                warn!("Rerank failed, using fusion order: {}", e);
                emitter.end(
                    stage,
                    json!({ "applied": false }),
                    vec![format!("{}; using fusion order", e)],
                );
                truncate_fused(fused, max_results)
            }
        }
    }

    /// Hand the final context to the generator. Failures are annotated only.
    async fn generate(
        &self,
        query: &Query,
        context: &[RankedResult],
        emitter: &Emitter,
    ) -> Option<String> {
        let generator = self.generator.as_ref()?;
        let stage = emitter.begin("generate");
        let texts: Vec<&str> = context
            .iter()
            .map(|r| {
                if r.candidate.text.is_empty() {
                    r.candidate.text_preview.as_str()
                } else {
                    r.candidate.text.as_str()
                }
            })
            .collect();

        match generator.generate(&texts, &query.raw_text).await {
            Ok(answer) => {
                emitter.end(
                    stage,
                    json!({ "context_chunks": texts.len(), "answer_chars": answer.chars().count() }),
                    Vec::new(),
                );
                Some(answer)
            }
            Err(e) => {
                warn!("Generation failed: {}", e);
                emitter.end(
                    stage,
                    json!({ "context_chunks": texts.len() }),
                    vec![e.to_string()],
                );
                None
            }
        }
    }
}
