use clap::Parser;
use proptest::prelude::*;
use rover_pilot::classifier::{CompiledModel, Layer, TensorShape};
use rover_pilot::config::{load_config, Engine};
use rover_pilot::{execute, Cli, Commands, ConfigSubcommand, ModelSubcommand};
use serial_test::serial;
use std::path::PathBuf;
use std::process::ExitCode;
use tempfile::tempdir;

proptest! {
    #[test]
    fn parse_teleop_bind(port in 1u16..u16::MAX) {
        let addr = format!("127.0.0.1:{port}");
        let cli = Cli::parse_from(["rover-pilot", "teleop", "--bind", &addr]);
        match cli.command {
            Commands::Teleop { bind, frames_dir } => {
                prop_assert_eq!(bind, Some(addr));
                prop_assert!(frames_dir.is_none());
            }
            _ => prop_assert!(false, "unexpected subcommand"),
        }
    }

    #[test]
    fn parse_autonomous_model(path in "[a-zA-Z0-9][a-zA-Z0-9/_\\.-]*") {
        let cli = Cli::parse_from(["rover-pilot", "autonomous", "--model", &path]);
        match cli.command {
            Commands::Autonomous { engine, model, frames_dir } => {
                prop_assert!(engine.is_none());
                prop_assert_eq!(model, Some(PathBuf::from(path)));
                prop_assert!(frames_dir.is_none());
            }
            _ => prop_assert!(false, "unexpected subcommand"),
        }
    }

    #[test]
    fn parse_collect_limit(limit in 1usize..10_000) {
        let cli = Cli::parse_from([
            "rover-pilot", "collect", "http://car/stream", "--limit", &limit.to_string(),
        ]);
        match cli.command {
            Commands::Collect { url, out, limit: l } => {
                prop_assert_eq!(url, "http://car/stream");
                prop_assert_eq!(out, PathBuf::from("dataset"));
                prop_assert_eq!(l, Some(limit));
            }
            _ => prop_assert!(false, "unexpected subcommand"),
        }
    }
}

#[test]
fn parse_engine_names() {
    let cli = Cli::parse_from(["rover-pilot", "autonomous", "--engine", "onnx"]);
    match cli.command {
        Commands::Autonomous { engine, .. } => assert_eq!(engine, Some(Engine::Onnx)),
        _ => panic!("unexpected subcommand"),
    }
    assert!(Cli::try_parse_from(["rover-pilot", "autonomous", "--engine", "tflite"]).is_err());
}

#[test]
fn parse_config_show() {
    let cli = Cli::parse_from(["rover-pilot", "config", "show"]);
    assert!(matches!(
        cli.command,
        Commands::Config {
            action: ConfigSubcommand::Show
        }
    ));
}

#[test]
#[serial]
fn config_init_writes_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("rover.json");
    std::env::set_var("ROVER_CONFIG_PATH", &path);
    let cli = Cli {
        command: Commands::Config {
            action: ConfigSubcommand::Init,
        },
    };
    assert_eq!(execute(cli), ExitCode::SUCCESS);
    assert!(path.exists());
    assert_eq!(load_config().default_speed, 200);
}

fn write_model(dir: &std::path::Path) -> PathBuf {
    let model = CompiledModel {
        input: TensorShape {
            height: 2,
            width: 2,
            channels: 1,
        },
        layers: vec![
            Layer::AvgPool { size: 2 },
            Layer::Dense {
                outputs: 3,
                relu: true,
                multiplier: 1 << 30,
                shift: 1,
                weights: vec![1, -1, 2],
                bias: vec![0, 0, 0],
            },
        ],
    };
    let path = dir.join("drive.rvqm");
    std::fs::write(&path, model.encode().unwrap()).unwrap();
    path
}

#[test]
fn model_inspect_accepts_valid_model() {
    let dir = tempdir().unwrap();
    let path = write_model(dir.path());
    let cli = Cli::parse_from(["rover-pilot", "model", "inspect", path.to_str().unwrap()]);
    assert!(matches!(
        &cli.command,
        Commands::Model {
            action: ModelSubcommand::Inspect { .. }
        }
    ));
    assert_eq!(execute(cli), ExitCode::SUCCESS);
}

#[test]
fn model_inspect_rejects_garbage() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("junk.rvqm");
    std::fs::write(&path, b"not a model").unwrap();
    let cli = Cli {
        command: Commands::Model {
            action: ModelSubcommand::Inspect { path },
        },
    };
    assert_eq!(execute(cli), ExitCode::FAILURE);
}

#[test]
fn collect_rejects_bad_url() {
    let dir = tempdir().unwrap();
    let cli = Cli {
        command: Commands::Collect {
            url: "car:80".to_string(),
            out: dir.path().join("out"),
            limit: None,
        },
    };
    assert_eq!(execute(cli), ExitCode::FAILURE);
}
