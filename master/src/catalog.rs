use common::{ClusterWorker, Phase, PreparedArtifact, StageDescriptor, StageOutput, StageWorker, SynthesisWorker};
use std::sync::Arc;
use worker::{
    AiClassifier, ArtMediumClassifier, ColorHistogram, FractalDimension, InsightSummarizer,
    MetadataInspector, ObjectDetector, Preprocessor,
};

use crate::config::Settings;
use crate::pipeline::{FinalizeWorker, InitWorker, Pipeline, Stage};
use crate::store::{PersistStage, RecordStore};

/// Pipeline de producción con los workers concretos.
pub fn default_pipeline(settings: &Settings, store: Arc<dyn RecordStore>) -> Pipeline {
    let desc = |name: &str, phase: Phase| StageDescriptor::new(name, phase, settings.timeout_for(name));

    let init_worker: Arc<InitWorker> = Arc::new(Preprocessor);
    let init = Stage::new(desc(worker::PREPROCESSING, Phase::Init), init_worker);

    let cluster = vec![
        cluster_stage(desc(worker::METADATA_ANALYSIS, Phase::Cluster), MetadataInspector::fallback(), MetadataInspector),
        cluster_stage(desc(worker::COLOR_HISTOGRAM, Phase::Cluster), ColorHistogram::fallback(), ColorHistogram),
        cluster_stage(desc(worker::AI_CLASSIFIER, Phase::Cluster), AiClassifier::fallback(), AiClassifier),
        cluster_stage(desc(worker::FRACTAL_DIMENSION, Phase::Cluster), FractalDimension::fallback(), FractalDimension),
        cluster_stage(desc(worker::ART_MEDIUM, Phase::Cluster), ArtMediumClassifier::fallback(), ArtMediumClassifier),
        cluster_stage(desc(worker::OBJECT_DETECTION, Phase::Cluster), ObjectDetector::fallback(), ObjectDetector),
    ];

    let summarizer: Arc<SynthesisWorker> = Arc::new(InsightSummarizer);
    let synthesis = vec![Stage::new(desc(worker::INSIGHT_SUMMARY, Phase::Synthesis), summarizer)];

    let persist: Arc<FinalizeWorker> = Arc::new(PersistStage::new(store));
    let finalize = Stage::new(desc(worker::SAVING, Phase::Finalize), persist);

    Pipeline {
        init,
        cluster,
        synthesis,
        finalize,
    }
}

fn cluster_stage<W>(descriptor: StageDescriptor, fallback: serde_json::Value, worker: W) -> Stage<ClusterWorker>
where
    W: StageWorker<Input = PreparedArtifact, Output = StageOutput>,
{
    let worker: Arc<ClusterWorker> = Arc::new(worker);
    Stage::new(descriptor.with_fallback(fallback), worker)
}
