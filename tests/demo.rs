use assert_cmd::prelude::*;
use image::{Rgb, RgbImage};
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::{TempDir, tempdir};

const TINY_CONFIG: &str = "\
INPUT:
  HEIGHT: 16
  WIDTH: 24
STRUCTURE:
  FEATURES: 4
MOTION:
  HIDDEN: 8
";

struct Fixture {
    dir: TempDir,
    cfg: PathBuf,
    model: PathBuf,
    sequence: PathBuf,
}

impl Fixture {
    fn output(&self) -> PathBuf {
        self.dir.path().join("output")
    }
}

fn write_frames(sequence: &Path, count: usize) -> Result<(), Box<dyn std::error::Error>> {
    fs::create_dir_all(sequence)?;
    for idx in 0..count {
        let frame = RgbImage::from_fn(48, 32, |x, y| {
            Rgb([(x * 5) as u8, (y * 7) as u8, (idx * 40) as u8])
        });
        frame.save(sequence.join(format!("{idx:03}.png")))?;
    }
    fs::write(
        sequence.join("intrinsics.txt"),
        "40.0 0.0 24.0\n0.0 40.0 16.0\n0.0 0.0 1.0\n",
    )?;
    Ok(())
}

fn fixture(frames: usize) -> Result<Fixture, Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let cfg = dir.path().join("tiny.yaml");
    fs::write(&cfg, TINY_CONFIG)?;

    let model = dir.path().join("tiny.mpk");
    Command::cargo_bin("init_checkpoint")?
        .arg("--cfg")
        .arg(&cfg)
        .arg("--output")
        .arg(&model)
        .assert()
        .success()
        .stdout(predicate::str::contains("wrote"));

    let sequence = dir.path().join("sequence");
    write_frames(&sequence, frames)?;

    Ok(Fixture {
        dir,
        cfg,
        model,
        sequence,
    })
}

fn demo_with(
    fixture: &Fixture,
    model: &Path,
    sequence: &Path,
) -> Result<Command, Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("demo_v2d")?;
    cmd.arg("--cfg")
        .arg(&fixture.cfg)
        .arg("--model")
        .arg(model)
        .arg("--sequence")
        .arg(sequence)
        .arg("--output")
        .arg(fixture.output());
    Ok(cmd)
}

fn demo(fixture: &Fixture) -> Result<Command, Box<dyn std::error::Error>> {
    demo_with(fixture, &fixture.model, &fixture.sequence)
}

#[test]
fn calibrated_keyframe_run() -> Result<(), Box<dyn std::error::Error>> {
    let fixture = fixture(5)?;

    demo(&fixture)?
        .arg("--n_iters")
        .arg("3")
        .assert()
        .success()
        .stdout(predicate::str::contains("depths: 5 x 16x24"))
        .stdout(predicate::str::contains("000.png"))
        .stdout(predicate::str::contains("poses: 5"))
        .stdout(predicate::str::contains("[20.0, 20.0, 12.0, 8.0]"));

    for idx in 0..5 {
        assert!(fixture.output().join(format!("depth_{idx:03}.png")).exists());
    }
    let poses = fs::read_to_string(fixture.output().join("poses.txt"))?;
    assert_eq!(poses.lines().count(), 5);

    Ok(())
}

#[test]
fn uncalibrated_global_run_with_subsampling() -> Result<(), Box<dyn std::error::Error>> {
    let fixture = fixture(6)?;

    demo(&fixture)?
        .arg("--uncalibrated")
        .arg("--mode")
        .arg("global")
        .arg("--fcrn")
        .arg("--n_frames")
        .arg("2")
        .arg("--seed")
        .arg("7")
        .arg("--no-viz")
        .assert()
        .success()
        .stdout(predicate::str::contains("depths: 3 x 16x24"))
        .stdout(predicate::str::contains("poses: 3"));

    assert!(!fixture.output().exists());

    Ok(())
}

#[test]
fn missing_sequence_fails() -> Result<(), Box<dyn std::error::Error>> {
    let fixture = fixture(2)?;

    demo_with(&fixture, &fixture.model, &fixture.dir.path().join("nowhere"))?
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));

    Ok(())
}

#[test]
fn missing_checkpoint_fails() -> Result<(), Box<dyn std::error::Error>> {
    let fixture = fixture(2)?;

    demo_with(&fixture, &fixture.dir.path().join("absent.mpk"), &fixture.sequence)?
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));

    Ok(())
}

#[test]
fn frame_limit_beyond_sequence_fails() -> Result<(), Box<dyn std::error::Error>> {
    let fixture = fixture(3)?;

    demo(&fixture)?
        .arg("--n_frames")
        .arg("5")
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot sample 5"));

    Ok(())
}
