use std::fs;
use std::process::Command;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use tempfile::tempdir;

const COHORT_HEADER: &str = "albumin\talkaline_phosphatase\tcreatinine\tfasting_glucose\tcrp\twbc\tlymphocyte_pct\tmcv\trdw\tage\tsex";

fn cohort_text(n: usize) -> String {
    let centres = [
        (4.3, 0.3),
        (70.0, 18.0),
        (0.85, 0.15),
        (92.0, 9.0),
        (1.2, 0.5),
        (6.5, 1.5),
        (30.0, 6.0),
        (89.0, 4.0),
        (13.0, 0.8),
    ];
    let mut rng = StdRng::seed_from_u64(7);
    let noise = Normal::new(0.0, 1.0).unwrap();
    let mut text = format!("{COHORT_HEADER}\n");
    for i in 0..n {
        let shared: f64 = noise.sample(&mut rng);
        for (centre, spread) in centres {
            let v: f64 = centre + spread * (0.3 * shared + noise.sample(&mut rng));
            text.push_str(&format!("{:.4}\t", v.abs().max(0.01)));
        }
        let age = 45.0 + 8.0 * shared + 5.0 * noise.sample(&mut rng);
        let sex = if i % 2 == 0 { "M" } else { "F" };
        text.push_str(&format!("{age:.1}\t{sex}\n"));
    }
    text
}

fn run(dir: &std::path::Path, args: &[&str]) -> std::process::Output {
    let exe = env!("CARGO_BIN_EXE_bioage");
    Command::new(exe)
        .current_dir(dir)
        .args(args)
        .output()
        .expect("run bioage cli")
}

#[test]
fn fit_score_classify_trend_history_round_trip() {
    let tmp = tempdir().expect("temporary directory");
    let dir = tmp.path();

    fs::write(dir.join("reference_cohort.tsv"), cohort_text(80)).unwrap();
    fs::write(
        dir.join("subjects.tsv"),
        "subject_id\tbirth_date\tsex\n1\t1974-09-30\tF\n",
    )
    .unwrap();
    let mut measurements = String::from("subject_id\ttaken_at\tbiomarker_id\tvalue\n");
    for (id, value) in [4.4, 72.0, 0.8, 88.0, 0.9, 5.8, 32.0, 88.0, 12.8]
        .into_iter()
        .enumerate()
    {
        measurements.push_str(&format!("1\t2024-04-02\t{}\t{value}\n", id + 1));
    }
    measurements.push_str("1\t2023-01-15\t5\t2.4\n");
    fs::write(dir.join("measurements.tsv"), measurements).unwrap();

    let fit = run(dir, &["fit-hd"]);
    assert!(fit.status.success(), "fit-hd failed: {:?}", fit);
    assert!(dir.join("hd_fit.toml").exists(), "hd_fit.toml missing");

    let score = run(dir, &["score", "1", "--date", "2024-06-01"]);
    assert!(score.status.success(), "score failed: {:?}", score);
    let stdout = String::from_utf8_lossy(&score.stdout);
    assert!(stdout.contains("Phenotypic Age"), "{stdout}");
    assert!(stdout.contains("Homeostatic Dysregulation"), "{stdout}");
    assert!(stdout.contains("chronological age 49"), "{stdout}");

    let classify = run(dir, &["classify", "1", "--ranges", "clinical", "--date", "2024-06-01"]);
    assert!(classify.status.success(), "classify failed: {:?}", classify);
    let stdout = String::from_utf8_lossy(&classify.stdout);
    assert_eq!(
        stdout.lines().filter(|l| l.contains("Optimal") || l.contains("Normal") || l.contains("Out of Range")).count(),
        9,
        "{stdout}"
    );

    let trend = run(dir, &["trend", "1", "crp", "--range", "2 years", "--date", "2024-06-01"]);
    assert!(trend.status.success(), "trend failed: {:?}", trend);
    let stdout = String::from_utf8_lossy(&trend.stdout);
    assert!(stdout.contains("2024-04-02"), "{stdout}");
    assert!(stdout.contains("2023-01-15"), "{stdout}");

    let short = run(dir, &["trend", "1", "5", "--range", "6 months", "--date", "2024-06-01"]);
    let stdout = String::from_utf8_lossy(&short.stdout);
    assert!(!stdout.contains("2023-01-15"), "{stdout}");

    let history = run(dir, &["history", "1", "--model", "hd"]);
    assert!(history.status.success(), "history failed: {:?}", history);
    let stdout = String::from_utf8_lossy(&history.stdout);
    assert_eq!(stdout.lines().count(), 1, "{stdout}");
}

#[test]
fn malformed_trend_range_exits_with_an_error() {
    let tmp = tempdir().expect("temporary directory");
    let output = run(tmp.path(), &["trend", "1", "crp", "--range", "abc"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("positive integer"), "{stderr}");
}

#[test]
fn scoring_without_data_reports_the_missing_file() {
    let tmp = tempdir().expect("temporary directory");
    let output = run(tmp.path(), &["score", "1"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.starts_with("Error:"), "{stderr}");
    assert!(stderr.contains("measurements.tsv"), "{stderr}");
}
