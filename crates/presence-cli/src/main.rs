use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use presence_core::{
    Decision, EngineSettings, EnrollError, FaceDetector, FaceService, Frame, FrameValidator, OnnxEmbedder,
    ScrfdDetector, UserId, ValidationVerdict,
};
use presence_store::EnrollmentStore;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "presence", about = "Face identification for attendance check-in", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect faces and print the validation verdict
    Check {
        /// Image file (any format the decoder understands)
        image: PathBuf,
    },
    /// Enroll a user's face, replacing any previous enrollment
    Enroll {
        #[arg(short, long)]
        user: i64,
        /// Organization the user belongs to
        #[arg(short, long)]
        org: Option<String>,
        image: PathBuf,
    },
    /// Identify who is in the image
    Identify { image: PathBuf },
    /// Verify that the image shows the given user
    Verify {
        #[arg(short, long)]
        user: i64,
        image: PathBuf,
    },
    /// List enrollment records
    List,
    /// Remove a user's enrollment
    Remove {
        #[arg(short, long)]
        user: i64,
    },
    /// Remove every enrollment of an organization
    Purge {
        #[arg(short, long)]
        org: String,
    },
    /// Show configuration, model and database status
    Status,
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Check { image } => {
            // Validation needs only the detector; the embedding model may be absent.
            let detector = load_detector(&config)?;
            let verdict = check_image(&detector, &config.engine, &image)?;
            print_json(&verdict.report())?;
            Ok(exit_code(verdict.is_valid))
        }
        Commands::Enroll { user, org, image } => {
            let user = UserId(user);
            let service = build_service(&config)?;
            let store = open_store(&config)?;
            let frame = match read_frame(&image)? {
                Ok(frame) => frame,
                Err(verdict) => {
                    print_json(&json!({ "success": false, "verdict": verdict.report() }))?;
                    return Ok(ExitCode::FAILURE);
                }
            };

            let embedding = match service.enroll_from_image(&frame) {
                Ok(embedding) => embedding,
                Err(e) => {
                    tracing::warn!(user = %user, error = %e, "enrollment refused");
                    let reason = match &e {
                        EnrollError::Rejected(reason) => reason.message().to_string(),
                        EnrollError::Extraction => e.to_string(),
                    };
                    print_json(&json!({ "success": false, "user_id": user, "error": reason }))?;
                    return Ok(ExitCode::FAILURE);
                }
            };

            let record = store.enroll(user, org.as_deref(), &embedding)?;
            service.rebuild(&store)?;
            print_json(&json!({ "success": true, "record": record }))?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Identify { image } => {
            let service = build_service(&config)?;
            let store = open_store(&config)?;
            service.rebuild(&store)?;

            let decision = match read_frame(&image)? {
                Ok(frame) => service.identify(&frame),
                Err(verdict) => Decision {
                    verdict,
                    result: None,
                },
            };
            if let Some(user) = decision.identity() {
                store.touch_last_used(user)?;
            }
            print_json(&decision_json(&decision))?;
            Ok(exit_code(decision.matched()))
        }
        Commands::Verify { user, image } => {
            let user = UserId(user);
            let service = build_service(&config)?;
            let store = open_store(&config)?;
            service.rebuild(&store)?;

            let decision = match read_frame(&image)? {
                Ok(frame) => service.verify(&frame, user),
                Err(verdict) => Decision {
                    verdict,
                    result: None,
                },
            };
            if decision.matched() {
                store.touch_last_used(user)?;
            }
            let mut out = decision_json(&decision);
            out["user_id"] = json!(user);
            print_json(&out)?;
            Ok(exit_code(decision.matched()))
        }
        Commands::List => {
            let store = open_store(&config)?;
            print_json(&store.list()?)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Remove { user } => {
            let store = open_store(&config)?;
            let removed = store.remove(UserId(user))?;
            print_json(&json!({ "user_id": user, "removed": removed }))?;
            Ok(exit_code(removed))
        }
        Commands::Purge { org } => {
            let store = open_store(&config)?;
            let removed = store.purge_organization(&org)?;
            print_json(&json!({ "organization": org, "removed": removed }))?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status => {
            let detector = config.detector_model_path();
            let embedder = config.embedding_model_path();
            let enrolled = match EnrollmentStore::open(&config.db_path) {
                Ok(store) => Some(store.list()?.iter().filter(|r| r.is_active).count()),
                Err(e) => {
                    tracing::warn!(error = %e, "database unavailable");
                    None
                }
            };
            print_json(&json!({
                "version": env!("CARGO_PKG_VERSION"),
                "db_path": config.db_path,
                "active_enrollments": enrolled,
                "detector_model": { "path": detector, "present": detector.exists() },
                "embedding_model": { "path": embedder, "present": embedder.exists() },
                "embedding_input_size": config.embedding_input_size,
                "embedding_dim": config.embedding_dim,
                "engine": config.engine,
            }))?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_detector(config: &Config) -> Result<ScrfdDetector> {
    ScrfdDetector::load(&config.detector_model_path()).context("loading face detector")
}

fn build_service(config: &Config) -> Result<FaceService> {
    let detector = load_detector(config)?;
    let embedder = OnnxEmbedder::load(
        &config.embedding_model_path(),
        config.embedding_input_size,
        config.embedding_dim,
    )
    .context("loading embedding model")?;
    let service = FaceService::new(Box::new(detector), Box::new(embedder), config.engine)?;
    Ok(service)
}

fn open_store(config: &Config) -> Result<EnrollmentStore> {
    EnrollmentStore::open(&config.db_path)
        .with_context(|| format!("opening enrollment database {}", config.db_path.display()))
}

/// Read and decode an image file. Undecodable content is a rejected verdict, not an error.
fn read_frame(path: &Path) -> Result<Result<Frame, ValidationVerdict>> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(Frame::decode(&bytes).map_err(|e| ValidationVerdict::undecodable(&e)))
}

/// Validate one image file with the detector alone.
fn check_image(detector: &dyn FaceDetector, settings: &EngineSettings, path: &Path) -> Result<ValidationVerdict> {
    settings.validate()?;
    let validator = FrameValidator::new(settings.confidence_floor, settings.min_face_fraction);
    Ok(match read_frame(path)? {
        Ok(frame) => validator.process(detector, &frame),
        Err(verdict) => verdict,
    })
}

fn decision_json(decision: &Decision) -> serde_json::Value {
    let mut out = json!({
        "matched": decision.matched(),
        "user_id": decision.identity(),
        "verdict": decision.verdict.report(),
    });
    if let Some(result) = &decision.result {
        out["similarity"] = json!(result.similarity);
    }
    out
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn exit_code(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use presence_core::detector::DetectorError;
    use presence_core::{DetectionBox, RejectReason};

    struct OneFace;

    impl FaceDetector for OneFace {
        fn candidates(&self, _frame: &Frame) -> Result<Vec<DetectionBox>, DetectorError> {
            Ok(vec![DetectionBox::new(10.0, 5.0, 30.0, 25.0, 0.99)])
        }
    }

    fn temp_file(name: &str, bytes: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("presence-cli-{}-{name}", std::process::id()));
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_check_image_uses_detector_only() {
        let img = image::RgbImage::from_pixel(40, 30, image::Rgb([120, 90, 60]));
        let mut png = std::io::Cursor::new(Vec::new());
        img.write_to(&mut png, image::ImageFormat::Png).unwrap();
        let path = temp_file("face.png", png.get_ref());

        let verdict = check_image(&OneFace, &EngineSettings::default(), &path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!(verdict.is_valid);
        assert_eq!(verdict.face_count, 1);
    }

    #[test]
    fn test_check_image_garbage_is_a_verdict() {
        let path = temp_file("garbage.png", b"not an image");
        let verdict = check_image(&OneFace, &EngineSettings::default(), &path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(verdict.reason, Some(RejectReason::InvalidImage));
    }

    #[test]
    fn test_check_image_refuses_bad_settings() {
        let settings = EngineSettings {
            min_face_fraction: 1.5,
            ..Default::default()
        };
        assert!(check_image(&OneFace, &settings, Path::new("/nonexistent.png")).is_err());
    }
}
