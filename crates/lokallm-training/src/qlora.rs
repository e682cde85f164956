//! Local QLoRA trainer.
//!
//! A run walks `CONFIGURED -> WEIGHTS_LOADED -> QUANTIZED -> ADAPTER_ATTACHED ->
//! DATASET_LOADED -> TRAINING -> SAVED`. Everything is written into a staging
//! directory next to the output directory and only moved into place once the
//! manifest is complete, so a failed run never leaves a partial adapter.

use crate::adapter::{save_adapter_weights, AdapterConfig};
use crate::artifacts::{make_artifact, write_json, ArtifactKind, TrainingArtifact, TrainingManifest, TrainingMetrics};
use crate::dataset::{compute_dataset_id, validate_examples, Dataset, LabeledExample};
use crate::error::{TrainingError, TrainingResult};
use crate::jsonl::read_jsonl_dataset;
use crate::layout::{AdapterLayout, ADAPTER_CONFIG_FILE, ADAPTER_WEIGHTS_FILE, MANIFEST_FILE};
use crate::lora::{AdaptedModel, EncodedExample, LoraGrads, QuantizedBase};
use crate::model::{BaseModel, BaseModelSource};
use crate::optim::{clip_grad_norm, AdamW, LrSchedule};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::tokenizer::{ByteTokenizer, TOKENIZER_CONFIG_FILE, TOKENIZER_VOCAB_FILE};
use crate::trainer::{Trainer, TrainerStatus, TrainingStage};
use crate::job::{TrainingJobId, TrainingJobSpec};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct QLoraTrainer {
    source: Arc<dyn BaseModelSource>,
    statuses: Arc<Mutex<HashMap<String, TrainerStatus>>>,
    cancel_requests: Arc<Mutex<HashSet<String>>>,
}

impl std::fmt::Debug for QLoraTrainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QLoraTrainer").field("source", &self.source.id()).finish_non_exhaustive()
    }
}

impl QLoraTrainer {
    #[must_use]
    pub fn new(source: Arc<dyn BaseModelSource>) -> Self {
        Self {
            source,
            statuses: Arc::new(Mutex::new(HashMap::new())),
            cancel_requests: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn set_status(&self, job_id: &TrainingJobId, status: TrainerStatus) {
        if let Ok(mut s) = self.statuses.lock() {
            s.insert(job_id.0.clone(), status);
        }
    }

    fn enter(&self, job_id: &TrainingJobId, stage: TrainingStage, progress: &dyn ProgressSink) {
        self.set_status(job_id, TrainerStatus::Running(stage));
        debug!(%job_id, %stage, "entering stage");
        progress.on_event(ProgressEvent::StageEntered { job_id: job_id.clone(), stage });
    }

    fn cancel_requested(&self, job_id: &TrainingJobId) -> bool {
        self.cancel_requests.lock().is_ok_and(|c| c.contains(&job_id.0))
    }

    async fn execute(
        &self,
        job: &TrainingJobSpec,
        progress: &dyn ProgressSink,
        staging: &Path,
        started: Instant,
    ) -> TrainingResult<TrainingManifest> {
        let job_id = &job.job_id;
        let config = &job.config;
        let hp = &config.hyperparams;

        // CONFIGURED: everything that can be checked without touching weights.
        self.enter(job_id, TrainingStage::Configured, progress);
        job.validate()?;
        check_output_dir(&job.output_dir)?;
        let dataset = read_jsonl_dataset(&job.dataset_path, job.validation)?;
        validate_examples(&dataset, job.validation)?;
        let dataset_id = compute_dataset_id(&dataset)?;
        info!(%job_id, records = dataset.len(), dataset = %job.dataset_path.display(), "dataset validated");

        self.enter(job_id, TrainingStage::WeightsLoaded, progress);
        let base = self.source.load(&config.base_model)?;
        let fingerprint = base.fingerprint();

        self.enter(job_id, TrainingStage::Quantized, progress);
        let quantized = QuantizedBase::quantize(&base, &config.quantization, &config.lora.target_modules)?;
        info!(
            %job_id,
            modules = quantized.modules.len(),
            quant_type = ?config.quantization.quant_type,
            double_quant = config.quantization.double_quant,
            "target modules quantized"
        );

        self.enter(job_id, TrainingStage::AdapterAttached, progress);
        let mut model = AdaptedModel::attach(quantized, &config.lora, hp.seed)?;
        let trainable = model.trainable_parameters();
        let total = model.base_parameters();
        progress.on_event(ProgressEvent::Parameters { job_id: job_id.clone(), trainable, total });
        if trainable >= total {
            return Err(TrainingError::InvalidConfig(format!(
                "lora r={} gives {trainable} trainable parameters, not fewer than the {total} of the base model",
                config.lora.r
            )));
        }

        self.enter(job_id, TrainingStage::DatasetLoaded, progress);
        let encoded = encode_dataset(&model, &base, &dataset, hp.max_seq_len as usize);
        if let Some(budget) = job.resources.memory_budget_bytes {
            let needed = model.estimated_training_bytes(&encoded);
            if needed > budget {
                return Err(TrainingError::ResourceExhausted(format!(
                    "training needs about {needed} bytes but the memory budget is {budget}"
                )));
            }
        }

        self.enter(job_id, TrainingStage::Training, progress);
        if let Some(parent) = job.output_dir.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        if staging.exists() {
            std::fs::remove_dir_all(staging)?;
        }
        std::fs::create_dir_all(staging)?;
        let staging_layout = AdapterLayout::new(staging);

        let outcome = self
            .train_loop(job, progress, &mut model, &encoded, &staging_layout, started)
            .await?;

        // SAVED: weights, config, tokenizer, manifest, then move into place.
        save_adapter_weights(&staging_layout.weights_path(), model.layers(), &config.base_model)?;
        let adapter_config =
            AdapterConfig::new(&config.base_model, &config.lora, &config.quantization, base.chat_template);
        write_json(&staging_layout.adapter_config_path(), &adapter_config)?;
        base.tokenizer_config(hp.max_seq_len as usize).save(staging)?;

        let mut artifacts = vec![
            make_artifact(ArtifactKind::AdapterWeights, staging, ADAPTER_WEIGHTS_FILE)?,
            make_artifact(ArtifactKind::AdapterConfig, staging, ADAPTER_CONFIG_FILE)?,
            make_artifact(ArtifactKind::TokenizerConfig, staging, TOKENIZER_CONFIG_FILE)?,
            make_artifact(ArtifactKind::Tokenizer, staging, TOKENIZER_VOCAB_FILE)?,
        ];
        artifacts.extend(outcome.checkpoints);

        let manifest = TrainingManifest {
            job_id: job_id.clone(),
            created_at: chrono::Utc::now(),
            base_model: config.base_model.clone(),
            base_fingerprint: fingerprint,
            config: config.clone(),
            dataset_id,
            num_examples: dataset.len(),
            metrics: TrainingMetrics {
                final_loss: outcome.final_loss,
                optimizer_steps: outcome.steps,
                epochs_completed: outcome.epochs_completed,
                trainable_parameters: trainable,
                total_parameters: total,
                duration_secs: started.elapsed().as_secs_f64(),
            },
            artifacts,
        };
        write_json(&staging.join(MANIFEST_FILE), &manifest)?;

        commit_staging(staging, &job.output_dir, &job_id.0)?;
        self.enter(job_id, TrainingStage::Saved, progress);
        Ok(manifest)
    }

    async fn train_loop(
        &self,
        job: &TrainingJobSpec,
        progress: &dyn ProgressSink,
        model: &mut AdaptedModel,
        encoded: &[EncodedExample],
        staging: &AdapterLayout,
        started: Instant,
    ) -> TrainingResult<LoopOutcome> {
        let job_id = &job.job_id;
        let config = &job.config;
        let hp = &config.hyperparams;

        let batch_size = hp.batch_size as usize;
        let accum = hp.gradient_accumulation_steps as usize;
        let micro_batches = encoded.len().div_ceil(batch_size);
        let steps_per_epoch = micro_batches.div_ceil(accum) as u64;
        let mut total_steps = steps_per_epoch * u64::from(hp.epochs);
        if let Some(max_steps) = job.resources.max_steps {
            total_steps = total_steps.min(max_steps);
        }

        let schedule = LrSchedule::new(hp.scheduler, hp.learning_rate, total_steps, hp.warmup_ratio);
        let mut optimizer = AdamW::new(model.layers(), hp.weight_decay);
        let mut grads: Vec<LoraGrads> = model.layers().iter().map(LoraGrads::zeros_like).collect();
        let mut rng = StdRng::seed_from_u64(hp.seed);
        let dropout = config.lora.dropout as f32;
        let deadline = job.resources.max_seconds.map(Duration::from_secs);

        info!(
            %job_id,
            examples = encoded.len(),
            epochs = hp.epochs,
            batch_size,
            gradient_accumulation_steps = accum,
            total_steps,
            warmup_steps = schedule.warmup_steps(),
            "starting training"
        );

        let mut outcome = LoopOutcome::default();
        let mut order: Vec<usize> = (0..encoded.len()).collect();

        'epochs: for epoch in 0..hp.epochs {
            order.shuffle(&mut rng);
            let mut window_loss = 0.0f64;

            for (micro, batch) in order.chunks(batch_size).enumerate() {
                if self.cancel_requested(job_id) {
                    return Err(TrainingError::Cancelled(job_id.to_string()));
                }

                let window_start = (micro / accum) * accum;
                let window_len = accum.min(micro_batches - window_start);
                let weight = 1.0 / (batch.len() * window_len) as f32;
                for &idx in batch {
                    let loss = model.forward_backward(&encoded[idx], dropout, &mut rng, &mut grads, weight);
                    window_loss += f64::from(loss * weight);
                }

                let window_done = (micro + 1) % accum == 0 || micro + 1 == micro_batches;
                if !window_done {
                    continue;
                }

                let lr = schedule.lr_at(outcome.steps);
                let grad_norm = clip_grad_norm(&mut grads, hp.max_grad_norm);
                optimizer.step(model.layers_mut(), &grads, lr);
                grads.iter_mut().for_each(LoraGrads::clear);
                outcome.steps += 1;
                outcome.final_loss = Some(window_loss);
                let step = outcome.steps;

                if step % hp.logging_steps == 0 || step == total_steps {
                    debug!(%job_id, epoch, step, grad_norm, "optimizer step");
                    progress.on_event(ProgressEvent::Step {
                        job_id: job_id.clone(),
                        step,
                        total: Some(total_steps),
                        loss: window_loss,
                        learning_rate: lr,
                    });
                }
                window_loss = 0.0;

                if step % hp.save_steps == 0 {
                    outcome.checkpoints.push(save_checkpoint(model, staging, step, &config.base_model)?);
                    progress.on_event(ProgressEvent::Checkpoint {
                        job_id: job_id.clone(),
                        step,
                        path: staging.checkpoint_dir(step),
                    });
                }

                if let Some(limit) = deadline {
                    if started.elapsed() > limit {
                        return Err(TrainingError::ResourceExhausted(format!(
                            "time budget of {}s exceeded after {step} steps",
                            limit.as_secs()
                        )));
                    }
                }

                if step >= total_steps {
                    if epoch + 1 < hp.epochs {
                        info!(%job_id, step, "step limit reached");
                    }
                    outcome.epochs_completed = epoch + 1;
                    break 'epochs;
                }

                tokio::task::yield_now().await;
            }

            outcome.epochs_completed = epoch + 1;
        }

        Ok(outcome)
    }
}

#[derive(Debug, Default)]
struct LoopOutcome {
    steps: u64,
    epochs_completed: u32,
    final_loss: Option<f64>,
    checkpoints: Vec<TrainingArtifact>,
}

fn save_checkpoint(
    model: &AdaptedModel,
    staging: &AdapterLayout,
    step: u64,
    base_model: &str,
) -> TrainingResult<TrainingArtifact> {
    let dir = staging.checkpoint_dir(step);
    std::fs::create_dir_all(&dir)?;
    save_adapter_weights(&dir.join(ADAPTER_WEIGHTS_FILE), model.layers(), base_model)?;
    make_artifact(
        ArtifactKind::Checkpoint,
        staging.root(),
        AdapterLayout::checkpoint_relative(step).join(ADAPTER_WEIGHTS_FILE),
    )
}

/// Renders each record with the base model's chat template, tokenizes the
/// prompt and the assistant target separately and truncates the pair to
/// `max_seq_len`.
fn encode_dataset(model: &AdaptedModel, base: &BaseModel, dataset: &Dataset, max_seq_len: usize) -> Vec<EncodedExample> {
    let template = base.chat_template;
    let tokenizer = ByteTokenizer::new(base.tokenizer_config(max_seq_len));
    let mut truncated = 0usize;

    let encoded = dataset
        .iter()
        .map(|ex: &LabeledExample| {
            let prompt_ids = tokenizer.encode_truncated(&template.render_prompt(&ex.instruction), max_seq_len);
            let mut completion_ids = tokenizer.encode(&format!("{}{}", ex.target, template.turn_close()));
            let room = max_seq_len.saturating_sub(prompt_ids.len());
            if completion_ids.len() > room {
                truncated += 1;
                completion_ids.truncate(room);
            }
            model.encode(&prompt_ids, &completion_ids)
        })
        .collect();

    if truncated > 0 {
        warn!(truncated, max_seq_len, "records truncated to the maximum sequence length");
    }
    encoded
}

/// The output directory may be absent, empty, or hold a previous adapter.
fn check_output_dir(dir: &Path) -> TrainingResult<()> {
    if !dir.exists() {
        return Ok(());
    }
    if !dir.is_dir() {
        return Err(TrainingError::InvalidConfig(format!("output_dir {} is not a directory", dir.display())));
    }
    let empty = std::fs::read_dir(dir)?.next().is_none();
    if empty || AdapterLayout::new(dir).is_adapter_dir() {
        return Ok(());
    }
    Err(TrainingError::InvalidConfig(format!(
        "output_dir {} is not empty and does not hold a previous adapter",
        dir.display()
    )))
}

/// Moves `staging` to `output_dir`. A previous adapter is set aside first and
/// put back if the move fails.
fn commit_staging(staging: &Path, output_dir: &Path, job_id: &str) -> TrainingResult<()> {
    check_output_dir(output_dir)?;
    let backup = AdapterLayout::backup_for(output_dir, job_id);
    let previous = output_dir.exists();
    if previous {
        std::fs::rename(output_dir, &backup)?;
    }

    if let Err(err) = std::fs::rename(staging, output_dir) {
        if previous {
            if let Err(restore) = std::fs::rename(&backup, output_dir) {
                warn!(path = %backup.display(), error = %restore, "failed to restore previous adapter");
            }
        }
        return Err(err.into());
    }

    if previous {
        if let Err(cleanup) = std::fs::remove_dir_all(&backup) {
            warn!(path = %backup.display(), error = %cleanup, "failed to remove previous adapter");
        }
    }
    Ok(())
}

#[async_trait]
impl Trainer for QLoraTrainer {
    fn id(&self) -> &'static str {
        "qlora"
    }

    async fn prepare(&self, job: &TrainingJobSpec) -> TrainingResult<()> {
        job.validate()?;
        check_output_dir(&job.output_dir)?;
        if !job.dataset_path.is_file() {
            return Err(TrainingError::Dataset(format!(
                "dataset {} does not exist",
                job.dataset_path.display()
            )));
        }
        Ok(())
    }

    async fn run(&self, job: &TrainingJobSpec, progress: &dyn ProgressSink) -> TrainingResult<TrainingManifest> {
        let job_id = job.job_id.clone();
        let started = Instant::now();
        let staging: PathBuf = AdapterLayout::staging_for(&job.output_dir, &job_id.0);
        progress.on_event(ProgressEvent::Started { job_id: job_id.clone() });

        let result = self.execute(job, progress, &staging, started).await;
        if let Ok(mut c) = self.cancel_requests.lock() {
            c.remove(&job_id.0);
        }

        match result {
            Ok(manifest) => {
                self.set_status(&job_id, TrainerStatus::Finished);
                progress.on_event(ProgressEvent::Finished { job_id, output_dir: job.output_dir.clone() });
                Ok(manifest)
            }
            Err(err) => {
                if staging.exists() {
                    if let Err(cleanup) = std::fs::remove_dir_all(&staging) {
                        warn!(path = %staging.display(), error = %cleanup, "failed to remove staging directory");
                    }
                }
                let status = match &err {
                    TrainingError::Cancelled(_) => TrainerStatus::Cancelled,
                    other => TrainerStatus::Failed(other.to_string()),
                };
                self.set_status(&job_id, status);
                progress.on_event(ProgressEvent::Failed { job_id, error: err.to_string() });
                Err(err)
            }
        }
    }

    async fn status(&self, job_id: &TrainingJobId) -> TrainingResult<TrainerStatus> {
        Ok(self
            .statuses
            .lock()
            .ok()
            .and_then(|s| s.get(&job_id.0).cloned())
            .unwrap_or(TrainerStatus::Idle))
    }

    async fn cancel(&self, job_id: &TrainingJobId) -> TrainingResult<()> {
        if let Ok(mut c) = self.cancel_requests.lock() {
            c.insert(job_id.0.clone());
        }
        info!(%job_id, "cancellation requested");
        Ok(())
    }
}
