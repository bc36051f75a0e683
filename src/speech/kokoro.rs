//! Kokoro speech host: text → phonemes → ONNX inference → rodio playback.
//!
//! Pipeline per utterance:
//! 1. Text → sentences (split on .!?)
//! 2. Sentence → phonemes (misaki-rs G2P)
//! 3. Phonemes → token IDs (tokenizer.json vocabulary)
//! 4. Token IDs + voice style + speed → ONNX inference → f32 audio (24kHz)
//! 5. Audio → rodio Sink with volume and playback speed, cancellable
//!
//! The model loads in the background; until it finishes the host reports no
//! voices. Rate and pitch map onto Kokoro's two knobs: the model speaks at
//! `rate / pitch` and the sink plays back at `pitch`, so the tempo works out to
//! `rate` while the voice shifts by `pitch`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use ndarray::{Array2, Array3};
use ndarray_npy::NpzReader;
use ort::value::Tensor;
use rodio::buffer::SamplesBuffer;
use rodio::Sink;
use tokio::sync::{watch, Mutex as AsyncMutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::host::{SpeechError, SpeechHost, Utterance, VoiceDescriptor};
use super::output::AudioOutput;
use crate::config::SpeechConfig;

const SAMPLE_RATE: u32 = 24000;
const MAX_TOKENS: usize = 510; // Voice style array first dimension

/// Timing breakdown of one utterance.
struct SpeakResult {
    generate_ms: f64,
    playback_ms: f64,
    cancelled: bool,
}

/// Style vectors indexed by token count. shape: (510, 256)
struct VoiceData {
    styles: Array2<f32>,
}

struct LoadedModel {
    // Mutex because ort 2.0 Session::run needs &mut
    session: Mutex<ort::session::Session>,
    phonemizer: misaki_rs::G2P,
    vocab: HashMap<char, i64>,
    voices: HashMap<String, VoiceData>,
}

struct ModelPaths {
    model: PathBuf,
    voices: PathBuf,
    tokenizer: PathBuf,
}

impl ModelPaths {
    fn from_config(config: &SpeechConfig) -> Self {
        let base_dir = std::env::current_dir().unwrap_or_default();
        let or_default = |configured: &str, file: &str| {
            if configured.is_empty() {
                base_dir.join(file)
            } else {
                PathBuf::from(configured)
            }
        };
        Self {
            model: or_default(&config.model_path, "kokoro-v1.0.onnx"),
            voices: or_default(&config.voices_path, "voices-v1.0.bin"),
            tokenizer: or_default(&config.tokenizer_path, "tokenizer.json"),
        }
    }
}

struct KokoroEngine {
    model: RwLock<Option<Arc<LoadedModel>>>,
    load_failed: AtomicBool,
    output: Option<Arc<AudioOutput>>,
    paths: ModelPaths,

    // Playback state
    cancel_flag: Arc<AtomicBool>,
    requests: RequestGate,
    active_sink: Arc<Mutex<Option<Sink>>>,

    changes: watch::Sender<u64>,
}

/// Speech host backed by the Kokoro ONNX model.
#[derive(Clone)]
pub struct KokoroHost {
    engine: Arc<KokoroEngine>,
}

impl KokoroHost {
    pub fn new(config: &SpeechConfig, output: Option<Arc<AudioOutput>>) -> Self {
        let (changes, _) = watch::channel(0);
        let engine = KokoroEngine {
            model: RwLock::new(None),
            load_failed: AtomicBool::new(false),
            output,
            paths: ModelPaths::from_config(config),
            cancel_flag: Arc::new(AtomicBool::new(false)),
            requests: RequestGate::new(),
            active_sink: Arc::new(Mutex::new(None)),
            changes,
        };
        Self {
            engine: Arc::new(engine),
        }
    }

    /// Load the model on the blocking pool. Voices appear once it finishes.
    pub fn spawn_load(&self) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            let paths = ModelPaths {
                model: engine.paths.model.clone(),
                voices: engine.paths.voices.clone(),
                tokenizer: engine.paths.tokenizer.clone(),
            };
            match tokio::task::spawn_blocking(move || load_model(&paths)).await {
                Ok(Ok(model)) => {
                    let count = model.voices.len();
                    *engine.model.write().unwrap_or_else(PoisonError::into_inner) =
                        Some(Arc::new(model));
                    engine.changes.send_modify(|v| *v += 1);
                    info!("Kokoro TTS ready with {count} voices");
                }
                Ok(Err(e)) => {
                    engine.load_failed.store(true, Ordering::Relaxed);
                    warn!("Failed to load TTS model: {e}");
                }
                Err(e) => {
                    engine.load_failed.store(true, Ordering::Relaxed);
                    warn!("TTS model loader panicked: {e}");
                }
            }
        })
    }
}

impl SpeechHost for KokoroHost {
    fn is_supported(&self) -> bool {
        !self.engine.load_failed.load(Ordering::Relaxed)
    }

    fn voices(&self) -> Vec<VoiceDescriptor> {
        let Some(model) = self.engine.loaded() else {
            return Vec::new();
        };
        let mut names: Vec<&String> = model.voices.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| VoiceDescriptor::new(name.as_str(), kokoro_language(name)))
            .collect()
    }

    fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.engine.changes.subscribe()
    }

    fn speak(&self, utterance: Utterance) -> Result<(), SpeechError> {
        if !self.is_supported() {
            return Err(SpeechError::Unsupported);
        }
        let model = self.engine.loaded().ok_or(SpeechError::NotLoaded)?;
        if !model.voices.contains_key(&utterance.voice) {
            return Err(SpeechError::UnknownVoice(utterance.voice));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SpeechError::NoRuntime)?;

        self.engine.cancel();
        let request = self.engine.requests.submit();
        let engine = Arc::clone(&self.engine);
        runtime.spawn(async move {
            engine.speak(request, model, utterance).await;
        });
        Ok(())
    }

    fn cancel(&self) {
        self.engine.cancel();
    }
}

impl KokoroEngine {
    fn loaded(&self) -> Option<Arc<LoadedModel>> {
        self.model
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn speak(&self, request: u64, model: Arc<LoadedModel>, utterance: Utterance) {
        let Some(_guard) = self.requests.acquire(request).await else {
            debug!("Utterance superseded while waiting for the speaker");
            return;
        };
        self.cancel_flag.store(false, Ordering::Relaxed);

        let t_total = Instant::now();
        let result = self.speak_inner(model, &utterance).await;

        info!(
            "TTS complete [{}]: gen={:.0}ms play={:.0}ms total={:.0}ms cancelled={}",
            utterance.voice,
            result.generate_ms,
            result.playback_ms,
            t_total.elapsed().as_secs_f64() * 1000.0,
            result.cancelled,
        );
    }

    async fn speak_inner(&self, model: Arc<LoadedModel>, utterance: &Utterance) -> SpeakResult {
        let sentences: Vec<String> = split_sentences(utterance.text.trim())
            .into_iter()
            .map(str::to_string)
            .collect();
        let pitch = utterance.pitch.max(0.1);
        let model_speed = utterance.rate / pitch;

        let mut result = SpeakResult {
            generate_ms: 0.0,
            playback_ms: 0.0,
            cancelled: false,
        };

        for (i, sentence) in sentences.into_iter().enumerate() {
            if self.cancel_flag.load(Ordering::Relaxed) {
                result.cancelled = true;
                info!("Cancelled before sentence {}", i + 1);
                break;
            }

            let t_gen = Instant::now();
            let generated = {
                let model = Arc::clone(&model);
                let voice = utterance.voice.clone();
                tokio::task::spawn_blocking(move || model.generate(&sentence, &voice, model_speed))
                    .await
            };
            result.generate_ms += t_gen.elapsed().as_secs_f64() * 1000.0;

            let samples = match generated {
                Ok(Ok(samples)) => samples,
                Ok(Err(e)) => {
                    warn!("TTS generation failed for sentence {}: {e}", i + 1);
                    continue;
                }
                Err(e) => {
                    warn!("TTS generation task failed: {e}");
                    continue;
                }
            };

            if self.cancel_flag.load(Ordering::Relaxed) {
                result.cancelled = true;
                info!("Cancelled after generating sentence {}", i + 1);
                break;
            }
            if samples.is_empty() {
                continue;
            }

            let t_play = Instant::now();
            let was_cancelled = self.play_audio(samples, utterance.volume, pitch).await;
            result.playback_ms += t_play.elapsed().as_secs_f64() * 1000.0;

            if was_cancelled {
                result.cancelled = true;
                info!("Cancelled during playback of sentence {}", i + 1);
                break;
            }
        }

        result
    }

    /// Play samples through rodio. Returns true if cancelled during playback.
    async fn play_audio(&self, samples: Vec<f32>, volume: f32, speed: f32) -> bool {
        let Some(output) = &self.output else {
            warn!("No audio output stream, dropping speech");
            return false;
        };

        let sink = output.sink();
        sink.set_volume(volume);
        sink.set_speed(speed);
        sink.append(SamplesBuffer::new(1, SAMPLE_RATE, samples));
        *self.active_sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);

        let cancel_flag = Arc::clone(&self.cancel_flag);
        let active_sink = Arc::clone(&self.active_sink);

        let was_cancelled = tokio::task::spawn_blocking(move || loop {
            let is_empty = active_sink
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .map_or(true, Sink::empty);
            if is_empty {
                return false;
            }
            if cancel_flag.load(Ordering::Relaxed) {
                if let Some(sink) = active_sink
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take()
                {
                    sink.stop();
                }
                return true;
            }
            std::thread::sleep(Duration::from_millis(50));
        })
        .await
        .unwrap_or(false);

        *self.active_sink.lock().unwrap_or_else(PoisonError::into_inner) = None;
        was_cancelled
    }

    /// Stop current playback and drop every request still waiting its turn.
    fn cancel(&self) {
        self.requests.supersede_all();
        self.cancel_flag.store(true, Ordering::Relaxed);
        if let Some(sink) = self
            .active_sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            sink.stop();
            debug!("TTS playback cancelled");
        }
    }
}

/// Serialises speak requests. Only the most recently submitted request may
/// play; anything submitted before a cancel is dropped when its turn comes.
struct RequestGate {
    latest: AtomicU64,
    lock: AsyncMutex<()>,
}

impl RequestGate {
    fn new() -> Self {
        Self {
            latest: AtomicU64::new(0),
            lock: AsyncMutex::new(()),
        }
    }

    fn submit(&self) -> u64 {
        self.latest.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn supersede_all(&self) {
        self.latest.fetch_add(1, Ordering::SeqCst);
    }

    /// Wait for the speaker. `None` if `request` was superseded meanwhile.
    async fn acquire(&self, request: u64) -> Option<MutexGuard<'_, ()>> {
        let guard = self.lock.lock().await;
        (self.latest.load(Ordering::SeqCst) == request).then_some(guard)
    }
}

impl LoadedModel {
    /// Generate audio samples for a single sentence.
    fn generate(&self, text: &str, voice: &str, speed: f32) -> Result<Vec<f32>, String> {
        let (phonemes, _tokens) = self
            .phonemizer
            .g2p(text)
            .map_err(|e| format!("Phonemization failed: {e}"))?;
        if phonemes.is_empty() {
            return Ok(Vec::new());
        }

        // Start and end padding around the known phoneme tokens.
        let mut token_ids: Vec<i64> = Vec::with_capacity(phonemes.len() + 2);
        token_ids.push(0);
        token_ids.extend(phonemes.chars().filter_map(|ch| self.vocab.get(&ch).copied()));
        token_ids.push(0);
        let n_tokens = token_ids.len().min(MAX_TOKENS);
        token_ids.truncate(n_tokens);

        let voice_data = self
            .voices
            .get(voice)
            .ok_or_else(|| format!("Voice not found: {voice}"))?;
        let style_idx = n_tokens.saturating_sub(2).min(voice_data.styles.nrows() - 1);
        let style_vec: Vec<f32> = voice_data.styles.row(style_idx).to_vec();

        let tokens_tensor = Array2::from_shape_vec((1, n_tokens), token_ids)
            .map_err(|e| format!("Failed to shape tokens: {e}"))
            .and_then(|a| Tensor::from_array(a).map_err(|e| format!("Failed to build tokens tensor: {e}")))?;
        let style_tensor = Array2::from_shape_vec((1, 256), style_vec)
            .map_err(|e| format!("Failed to shape style: {e}"))
            .and_then(|a| Tensor::from_array(a).map_err(|e| format!("Failed to build style tensor: {e}")))?;
        let speed_tensor = Tensor::from_array(ndarray::Array1::from_vec(vec![speed]))
            .map_err(|e| format!("Failed to build speed tensor: {e}"))?;

        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let outputs = session
            .run(ort::inputs![
                "tokens" => tokens_tensor,
                "style" => style_tensor,
                "speed" => speed_tensor
            ])
            .map_err(|e| format!("ONNX inference failed: {e}"))?;

        let first_output = outputs
            .iter()
            .next()
            .ok_or("No output tensor from model")?;
        let (_shape, audio) = first_output
            .1
            .try_extract_tensor::<f32>()
            .map_err(|e| format!("Failed to extract audio tensor: {e}"))?;

        let samples: Vec<f32> = audio.to_vec();
        debug!(
            "Generated {} samples ({:.1}s)",
            samples.len(),
            samples.len() as f32 / SAMPLE_RATE as f32
        );
        Ok(samples)
    }
}

/// Load tokenizer, voices, ONNX session and phonemizer. Blocking.
fn load_model(paths: &ModelPaths) -> Result<LoadedModel, String> {
    let t0 = Instant::now();

    info!("Loading tokenizer from {}", paths.tokenizer.display());
    let vocab = load_tokenizer(&paths.tokenizer)?;

    info!("Loading voices from {}", paths.voices.display());
    let voices = load_voices(&paths.voices)?;

    info!("Loading ONNX model from {}", paths.model.display());
    let session = ort::session::Session::builder()
        .map_err(|e| format!("Failed to create ONNX session builder: {e}"))?
        .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)
        .map_err(|e| format!("Failed to set optimization level: {e}"))?
        .with_intra_threads(4)
        .map_err(|e| format!("Failed to set thread count: {e}"))?
        .commit_from_file(&paths.model)
        .map_err(|e| format!("Failed to load ONNX model: {e}"))?;

    let phonemizer = misaki_rs::G2P::new(misaki_rs::Language::EnglishUS);

    info!(
        "Kokoro TTS loaded in {}ms ({} tokens, {} voices)",
        t0.elapsed().as_millis(),
        vocab.len(),
        voices.len()
    );
    Ok(LoadedModel {
        session: Mutex::new(session),
        phonemizer,
        vocab,
        voices,
    })
}

/// Load tokenizer vocabulary from tokenizer.json.
fn load_tokenizer(path: &Path) -> Result<HashMap<char, i64>, String> {
    let contents =
        fs::read_to_string(path).map_err(|e| format!("Failed to read tokenizer: {e}"))?;
    let data: serde_json::Value = serde_json::from_str(&contents)
        .map_err(|e| format!("Failed to parse tokenizer JSON: {e}"))?;
    let vocab = data["model"]["vocab"]
        .as_object()
        .ok_or("Missing model.vocab in tokenizer.json")?;

    let mut map = HashMap::new();
    for (token, id) in vocab {
        let id = id.as_i64().ok_or("Token ID is not an integer")?;
        if let Some(ch) = token.chars().next() {
            map.insert(ch, id);
        }
    }
    Ok(map)
}

/// Load all voice styles from the NPZ voice pack.
fn load_voices(path: &Path) -> Result<HashMap<String, VoiceData>, String> {
    let file = fs::File::open(path).map_err(|e| format!("Failed to open voices file: {e}"))?;
    let mut npz =
        NpzReader::new(file).map_err(|e| format!("Failed to read NPZ voices file: {e}"))?;

    let names: Vec<String> = npz
        .names()
        .map_err(|e| format!("Failed to list NPZ entries: {e}"))?
        .into_iter()
        .map(|n| n.trim_end_matches(".npy").to_string())
        .collect();

    let mut voices = HashMap::new();
    for name in names {
        let arr: Array3<f32> = npz
            .by_name(&format!("{name}.npy"))
            .map_err(|e| format!("Failed to read voice '{name}': {e}"))?;
        // (510, 1, 256) → (510, 256)
        let (dim0, dim2) = (arr.shape()[0], arr.shape()[2]);
        let styles = arr
            .into_shape_with_order((dim0, dim2))
            .map_err(|e| format!("Failed to reshape voice '{name}': {e}"))?;
        voices.insert(name, VoiceData { styles });
    }
    Ok(voices)
}

/// Language tag for a Kokoro voice, from the first letter of its name
/// (`af_heart` → American English, `bf_emma` → British English, ...).
pub fn kokoro_language(voice: &str) -> &'static str {
    match voice.chars().next() {
        Some('a') => "en-US",
        Some('b') => "en-GB",
        Some('e') => "es-ES",
        Some('f') => "fr-FR",
        Some('h') => "hi-IN",
        Some('i') => "it-IT",
        Some('j') => "ja-JP",
        Some('p') => "pt-BR",
        Some('z') => "zh-CN",
        _ => "und",
    }
}

/// Split text into sentences at .!? boundaries.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();

    for (i, &b) in bytes.iter().enumerate() {
        if matches!(b, b'.' | b'!' | b'?') && bytes.get(i + 1).is_some_and(u8::is_ascii_whitespace) {
            let s = text[start..=i].trim();
            if !s.is_empty() {
                sentences.push(s);
            }
            start = i + 1;
        }
    }

    let rest = text[start..].trim();
    if !rest.is_empty() {
        sentences.push(rest);
    }
    sentences
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn newest_request_wins_the_speaker() {
        let gate = RequestGate::new();
        let first = gate.submit();
        let second = gate.submit();

        assert!(gate.acquire(first).await.is_none());
        assert!(gate.acquire(second).await.is_some());
    }

    #[tokio::test]
    async fn cancel_drops_requests_waiting_for_the_speaker() {
        let gate = Arc::new(RequestGate::new());
        let playing = gate.submit();
        let held = gate.acquire(playing).await.unwrap();

        let queued = gate.submit();
        let waiting = tokio::spawn({
            let gate = Arc::clone(&gate);
            async move { gate.acquire(queued).await.is_some() }
        });
        tokio::task::yield_now().await;

        gate.supersede_all();
        drop(held);
        assert!(!waiting.await.unwrap());

        // A request submitted after the cancel still plays.
        let next = gate.submit();
        assert!(gate.acquire(next).await.is_some());
    }

    #[test]
    fn voice_prefix_maps_to_language() {
        assert_eq!(kokoro_language("af_heart"), "en-US");
        assert_eq!(kokoro_language("bm_george"), "en-GB");
        assert_eq!(kokoro_language("ef_dora"), "es-ES");
        assert_eq!(kokoro_language("xx"), "und");
    }

    #[test]
    fn splits_announcements_into_sentences() {
        assert_eq!(
            split_sentences("Great! Juan just paid 12.50 pesos. Thank you!"),
            ["Great!", "Juan just paid 12.50 pesos.", "Thank you!"]
        );
        assert_eq!(split_sentences("   "), Vec::<&str>::new());
    }

    #[tokio::test]
    async fn no_voices_and_not_loaded_before_model() {
        let host = KokoroHost::new(&SpeechConfig::default(), None);
        assert!(host.is_supported());
        assert!(host.voices().is_empty());
        let err = host
            .speak(Utterance {
                text: "hello".into(),
                voice: "af_heart".into(),
                lang: "en-US".into(),
                rate: 1.0,
                pitch: 1.0,
                volume: 1.0,
            })
            .unwrap_err();
        assert!(matches!(err, SpeechError::NotLoaded));
    }

    #[tokio::test]
    async fn missing_model_files_mark_host_unsupported() {
        let config = SpeechConfig {
            model_path: "/nonexistent/kokoro.onnx".into(),
            voices_path: "/nonexistent/voices.bin".into(),
            tokenizer_path: "/nonexistent/tokenizer.json".into(),
            ..SpeechConfig::default()
        };
        let host = KokoroHost::new(&config, None);
        host.spawn_load().await.unwrap();
        assert!(!host.is_supported());
    }
}
