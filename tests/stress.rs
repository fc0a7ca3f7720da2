use anyhow::Result;
use std::collections::HashSet;
use std::fs;
use std::io::{stderr, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use rand::Rng;
use sysinfo::System;
use tempfile::tempdir;
use readscrub::PairMode;
use readscrub::utils::command::DatabaseJob;
use readscrub::utils::fastx::{read_all, ReadRecord};
use readscrub::utils::merge::{merge_files, MergeKind};
use readscrub::utils::repeats::{remove_repeats, RepeatFinder, RepeatOutputs};
use readscrub::utils::sambam::{reconcile_pairs, ReconcileOutputs};
use readscrub::utils::scheduler::run_jobs;
use readscrub::utils::sequence::{generate_rng, synthetic_reads, tandem_repeat_read, write_reads};


fn used_memory_mb(sys: &mut System) -> u64 {
    sys.refresh_memory();
    sys.used_memory() / 1024 / 1024
}

fn sam_line(read: &ReadRecord, aligned: bool) -> String {
    format!(
        "{}\t{}\tref\t1\t42\t{}M\t*\t0\t0\t{}\t{}\n",
        read.id,
        if aligned { 0 } else { 4 },
        read.seq.len(),
        String::from_utf8_lossy(&read.seq),
        String::from_utf8_lossy(&read.qual)
    )
}


#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_merge_stress() -> Result<()> {
    let dir = tempdir()?;
    let mut log = fs::File::create(dir.path().join("merge_stress.log"))?;
    writeln!(&mut log, "Reads\tDatabases\tKept\tTime\tMemory")?;
    let mut sys = System::new_all();

    for &num_reads in &[1_000usize, 20_000] {
        let mut rng = generate_rng(Some(num_reads as u64));
        let reads = synthetic_reads(&mut rng, "read", num_reads, 100, None);

        // Each database keeps ~90% of reads as clean
        let mut per_db = Vec::new();
        let mut kept_sets = Vec::new();
        for db in 0..3 {
            let kept: Vec<ReadRecord> = reads.iter().filter(|_| rng.random_bool(0.9)).cloned().collect();
            kept_sets.push(kept.iter().map(|r| r.id.clone()).collect::<HashSet<_>>());
            let path = dir.path().join(format!("db{}_clean.fastq", db));
            write_reads(&path, &kept)?;
            per_db.push(path);
        }
        let expected: Vec<String> = reads
            .iter()
            .filter(|r| kept_sets.iter().all(|s| s.contains(&r.id)))
            .map(|r| r.id.clone())
            .collect();

        let memory_before = used_memory_mb(&mut sys);
        let start = Instant::now();
        let out = dir.path().join("merged.fastq");
        let stats = merge_files(MergeKind::Intersection, &per_db, &out, true)?;
        let elapsed = start.elapsed().as_secs_f64();
        let memory_used = used_memory_mb(&mut sys).saturating_sub(memory_before);

        let merged: Vec<String> = read_all(&out)?.into_iter().map(|r| r.id).collect();
        assert_eq!(merged, expected);
        assert_eq!(stats.output as usize, expected.len());

        let union_out = dir.path().join("union.fastq");
        let union = merge_files(MergeKind::Union, &per_db, &union_out, false)?;
        let expected_union = kept_sets.iter().flatten().collect::<HashSet<_>>().len();
        assert_eq!(union.output as usize, expected_union);
        assert!(per_db.iter().all(|p| !p.exists()));

        writeln!(&mut log, "{}\t3\t{}\t{}\t{}", num_reads, stats.output, elapsed, memory_used)?;
        log.flush()?;
    }
    Ok(())
}


#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reconcile_stress() -> Result<()> {
    let dir = tempdir()?;
    let num_pairs = 10_000;
    let mut rng = generate_rng(Some(11));
    let mate1 = synthetic_reads(&mut rng, "frag", num_pairs, 75, Some(1));
    let mate2 = synthetic_reads(&mut rng, "frag", num_pairs, 75, Some(2));

    let mut sam1 = String::from("@HD\tVN:1.6\n");
    let mut sam2 = String::from("@HD\tVN:1.6\n");
    let mut expect_both = 0u64;
    let mut expect_either = 0u64;
    for (r1, r2) in mate1.iter().zip(&mate2) {
        let (a1, a2) = (rng.random_bool(0.3), rng.random_bool(0.3));
        expect_both += (a1 && a2) as u64;
        expect_either += (a1 || a2) as u64;
        sam1.push_str(&sam_line(r1, a1));
        sam2.push_str(&sam_line(r2, a2));
    }
    let p1 = dir.path().join("m1.sam");
    let p2 = dir.path().join("m2.sam");
    fs::write(&p1, sam1)?;
    fs::write(&p2, sam2)?;

    let strict = reconcile_pairs(&p1, &p2, None, PairMode::Strict, &ReconcileOutputs::new(dir.path(), "strict"))?;
    let lenient = reconcile_pairs(&p1, &p2, None, PairMode::Lenient, &ReconcileOutputs::new(dir.path(), "lenient"))?;

    for counts in [&strict, &lenient] {
        assert_eq!(counts.pairs, num_pairs as u64);
        assert_eq!(counts.partition_total(), counts.pairs);
    }
    assert_eq!(strict.both_aligned, expect_both);
    assert_eq!(lenient.both_aligned, expect_either);
    assert!(lenient.both_aligned >= strict.both_aligned);

    // Every read lands in exactly one of its mate's four files
    let outputs = ReconcileOutputs::new(dir.path(), "strict");
    for (mate, reads) in [(1usize, &mate1), (2, &mate2)] {
        let mut total = 0;
        for path in outputs.mate(mate).all() {
            total += read_all(path)?.len();
        }
        assert_eq!(total, reads.len());
    }
    Ok(())
}


#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scheduler_stress() -> Result<()> {
    for &limit in &[1usize, 3, 8] {
        let jobs: Vec<DatabaseJob> = (0..16)
            .map(|i| DatabaseJob {
                name: format!("job{}", i),
                database: format!("db{}", i),
                args: vec!["sh".to_string(), "-c".to_string(), format!("sleep 0.05; echo done {}", i)],
                inputs: vec![],
                outputs: vec![],
                primary_output: None::<PathBuf>,
            })
            .collect();
        let start = Instant::now();
        let report = run_jobs(jobs, limit).await?;
        eprintln!("limit {}: peak {} in {:?}", limit, report.peak_running, start.elapsed());
        stderr().flush()?;
        assert!(report.peak_running <= limit);
        assert_eq!(report.results.len(), 16);
        assert_eq!(report.results[15].stdout.trim(), "done 15");
    }
    Ok(())
}


fn repeat_input(dir: &Path, num_reads: usize) -> Result<(PathBuf, usize)> {
    let mut rng = generate_rng(Some(5));
    let mut reads = synthetic_reads(&mut rng, "plain", num_reads, 120, None);
    let mut repeats = 0;
    for i in (0..reads.len()).step_by(10) {
        reads[i] = tandem_repeat_read(&format!("rep{}", i), b"CAG", 120);
        repeats += 1;
    }
    let path = dir.join("reads.fastq");
    write_reads(&path, &reads)?;
    Ok((path, repeats))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_repeat_pipeline_stress() -> Result<()> {
    let dir = tempdir()?;
    let num_reads = 50_000;
    let (input, repeats) = repeat_input(dir.path(), num_reads)?;

    // Streams one group per `rep` read as it goes, like the real finder with -ngs
    let finder = RepeatFinder {
        program: "sh".to_string(),
        args: vec![
            "-c".to_string(),
            "awk '/^>rep/ { print \"@\" substr($0, 2); print \"1 6 3 2.0 3 100 0 12 0 33 33 33 1.58 CAG CAGCAG\" }'".to_string(),
        ],
    };
    let outputs = RepeatOutputs {
        filtered: Some(dir.path().join("filtered.fastq")),
        masked: Some(dir.path().join("masked.fastq")),
    };

    let start = Instant::now();
    let stats = remove_repeats(&input, &finder, &outputs).await?;
    eprintln!("Repeat pipeline: {} reads in {:?}", stats.reads, start.elapsed());

    assert_eq!(stats.reads as usize, num_reads);
    assert_eq!(stats.with_repeats as usize, repeats);

    let filtered = read_all(outputs.filtered.as_ref().unwrap())?;
    assert_eq!(filtered.len(), num_reads - repeats);
    assert!(filtered.iter().all(|r| r.id.starts_with("plain")));

    let masked = read_all(outputs.masked.as_ref().unwrap())?;
    assert_eq!(masked.len(), num_reads);
    assert_eq!(&masked[0].seq[..8], b"NNNNNNCA");
    assert!(masked.iter().all(|r| r.seq.len() == r.qual.len()));
    Ok(())
}
