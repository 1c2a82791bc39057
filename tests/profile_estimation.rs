use approx::assert_abs_diff_eq;
use bgprofile::config::EstimatorConfig;
use bgprofile::diagnostics::{NoopSink, TextReport};
use bgprofile::nnls::ActiveSetNnls;
use bgprofile::pipeline::{estimate_profiles, load_inputs};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

const HEADER: &str = "name\tallele\tforward\treverse\tflags\n";

/// Writes one sample file. Rows are (marker, sequence, forward, reverse, is_allele).
fn write_sample(dir: &Path, file: &str, rows: &[(&str, &str, u64, u64, bool)]) -> PathBuf {
    let mut content = HEADER.to_string();
    for &(marker, sequence, forward, reverse, is_allele) in rows {
        let flag = if is_allele { "ALLELE" } else { "" };
        content.push_str(&format!("{marker}\t{sequence}\t{forward}\t{reverse}\t{flag}\n"));
    }
    let path = dir.join(file);
    fs::write(&path, content).unwrap();
    path
}

fn run_to_json(files: &[PathBuf], allele_list: Option<&Path>, config: &EstimatorConfig) -> Value {
    let samples = load_inputs(files, allele_list, Some("flags")).unwrap();
    let nnls = ActiveSetNnls::default();
    let report = estimate_profiles(samples, config, &nnls, &mut NoopSink).unwrap();
    let mut out = Vec::new();
    report.write_json(&mut out, false).unwrap();
    serde_json::from_slice(&out).unwrap()
}

#[test]
fn homozygous_samples_yield_mean_background() {
    let dir = tempdir().unwrap();
    let files = vec![
        write_sample(
            dir.path(),
            "S1.csv",
            &[("TH01", "A", 1000, 800, true), ("TH01", "B", 100, 40, false)],
        ),
        write_sample(
            dir.path(),
            "S2.csv",
            &[("TH01", "A", 500, 400, true), ("TH01", "B", 30, 16, false)],
        ),
        write_sample(
            dir.path(),
            "S3.csv",
            &[("TH01", "A", 2000, 1000, true), ("TH01", "B", 280, 60, false)],
        ),
    ];

    let json = run_to_json(&files, None, &EstimatorConfig::default());
    let th01 = &json["TH01"];
    assert_eq!(th01["true alleles"], 1);
    assert_eq!(th01["alleles"], serde_json::json!(["A", "B"]));
    // Forward: 10, 6 and 14 percent; reverse: 5, 4 and 6 percent.
    assert_eq!(th01["profiles_forward"], serde_json::json!([[100.0, 10.0]]));
    assert_eq!(th01["profiles_reverse"], serde_json::json!([[100.0, 5.0]]));
}

#[test]
fn heterozygotes_are_explained_by_homozygote_profiles() {
    let dir = tempdir().unwrap();
    // Allele A puts 10% at C and allele B puts 20% at C; heterozygotes see the sum.
    let mut files = Vec::new();
    for i in 0..4 {
        files.push(write_sample(
            dir.path(),
            &format!("homA{i}.csv"),
            &[("M", "A", 1000, 1000, true), ("M", "C", 100, 100, false)],
        ));
        files.push(write_sample(
            dir.path(),
            &format!("homB{i}.csv"),
            &[("M", "B", 1000, 1000, true), ("M", "C", 200, 200, false)],
        ));
        files.push(write_sample(
            dir.path(),
            &format!("het{i}.csv"),
            &[
                ("M", "A", 600, 600, true),
                ("M", "B", 600, 600, true),
                ("M", "C", 180, 180, false),
            ],
        ));
    }

    let json = run_to_json(&files, None, &EstimatorConfig::default());
    let marker = &json["M"];
    assert_eq!(marker["true alleles"], 2);
    let alleles: Vec<&str> = marker["alleles"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a.as_str().unwrap())
        .collect();
    assert_eq!(alleles, vec!["A", "B", "C"]);

    let profiles = &marker["profiles_forward"];
    assert_eq!(profiles[0][0], 100.0);
    assert_eq!(profiles[1][1], 100.0);
    assert_abs_diff_eq!(profiles[0][2].as_f64().unwrap(), 10.0, epsilon = 1e-3);
    assert_abs_diff_eq!(profiles[1][2].as_f64().unwrap(), 20.0, epsilon = 1e-3);
    assert_abs_diff_eq!(profiles[0][1].as_f64().unwrap(), 0.0, epsilon = 1e-3);
}

#[test]
fn sporadic_background_is_filtered_and_allele_lists_are_honoured() {
    let dir = tempdir().unwrap();
    let mut files = Vec::new();
    for i in 0..10 {
        let mut rows = vec![("vWA", "REF", 1000, 1000, false), ("vWA", "STUTTER", 50, 50, false)];
        if i == 0 {
            rows.push(("vWA", "RARE", 40, 40, false));
        }
        files.push(write_sample(dir.path(), &format!("P{i}.tsv"), &rows));
    }
    let list = dir.path().join("alleles.tsv");
    let mut content = "sample\tmarker\tallele\n".to_string();
    for i in 0..10 {
        content.push_str(&format!("P{i}\tvWA\tREF\n"));
    }
    fs::write(&list, content).unwrap();

    let json = run_to_json(&files, Some(&list), &EstimatorConfig::default());
    assert_eq!(json["vWA"]["alleles"], serde_json::json!(["REF", "STUTTER"]));
    assert_eq!(json["vWA"]["profiles_forward"], serde_json::json!([[100.0, 5.0]]));
}

#[test]
fn variance_run_writes_report_and_caveat() {
    let dir = tempdir().unwrap();
    let files: Vec<PathBuf> = [(100, 10), (100, 6), (100, 14)]
        .iter()
        .enumerate()
        .map(|(i, &(reads, noise))| {
            write_sample(
                dir.path(),
                &format!("V{i}.csv"),
                &[("D8", "A", reads, reads, true), ("D8", "B", noise, noise, false)],
            )
        })
        .collect();

    let config = EstimatorConfig {
        variance: true,
        ..EstimatorConfig::default()
    };
    let samples = load_inputs(&files, None, Some("flags")).unwrap();
    let nnls = ActiveSetNnls::default();
    let mut sink = TextReport::new(Vec::new());
    let report = estimate_profiles(samples, &config, &nnls, &mut sink).unwrap();

    let marker = report.get("D8").unwrap();
    assert_eq!(marker.profiles_forward, vec![vec![100.0, 10.0]]);
    assert_eq!(marker.variances_forward, Some(vec![vec![0.0, 10.667]]));
    assert_eq!(marker.variances_reverse, Some(vec![vec![0.0, 10.667]]));
    assert!(marker.variance_caveat.is_some());

    let text = String::from_utf8(sink.into_inner()).unwrap();
    assert!(text.contains("Solving marker D8 with n=1, m=2, k=3"));
    assert!(text.contains("Solving reverse read profiles"));
    assert!(text.contains("Computing variances..."));
    assert!(text.contains("population variances"));
}
