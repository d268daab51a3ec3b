//! Integration tests for Sampler.

use std::collections::HashSet;

use candle_core::{Device, Tensor};
use nano_genai::{GenerationConfig, Sampler};

fn test_device() -> Device {
    Device::Cpu
}

fn sampling_config() -> GenerationConfig {
    GenerationConfig {
        max_new_tokens: Some(10),
        do_sample: true,
        temperature: 1.0,
        top_k: 50,
        top_p: 1.0,
        ..Default::default()
    }
}

#[test]
fn test_greedy_sampling() {
    let mut sampler = Sampler::with_seed(&GenerationConfig::greedy(), 42);
    let device = test_device();

    // Token 3 has the highest value
    let logits = Tensor::new(&[0.1f32, 0.2, 0.3, 10.0, 0.4], &device).unwrap();
    let sampled = sampler.sample(&logits, &[]).unwrap().unwrap();

    assert_eq!(sampled.token, 3);
    assert!(sampled.log_prob < 0.0);
}

#[test]
fn test_greedy_log_prob_uniform() {
    let mut sampler = Sampler::with_seed(&GenerationConfig::greedy(), 0);
    let logits = Tensor::new(&[1.0f32, 1.0, 1.0, 1.0], &test_device()).unwrap();

    let sampled = sampler.sample(&logits, &[]).unwrap().unwrap();

    // Ties go to the lowest id
    assert_eq!(sampled.token, 0);
    assert!((sampled.log_prob - 0.25f32.ln()).abs() < 1e-5);
}

#[test]
fn test_sample_uses_last_row() {
    let mut sampler = Sampler::with_seed(&GenerationConfig::greedy(), 0);
    let logits = Tensor::new(&[[5.0f32, 0.0, 0.0], [0.0, 0.0, 5.0]], &test_device()).unwrap();

    let sampled = sampler.sample(&logits, &[]).unwrap().unwrap();
    assert_eq!(sampled.token, 2);
}

#[test]
fn test_temperature_sampling() {
    let mut sampler = Sampler::with_seed(&sampling_config(), 42);
    let logits = Tensor::new(&[1.0f32, 1.0, 1.0, 1.0, 1.0], &test_device()).unwrap();

    let mut seen = HashSet::new();
    for _ in 0..100 {
        seen.insert(sampler.sample(&logits, &[]).unwrap().unwrap().token);
    }

    assert!(seen.len() > 1, "Should sample different tokens");
}

#[test]
fn test_top_k_sampling() {
    let config = GenerationConfig {
        top_k: 2,
        ..sampling_config()
    };
    let mut sampler = Sampler::with_seed(&config, 42);
    let logits = Tensor::new(&[0.1f32, 0.2, 0.3, 10.0, 9.0], &test_device()).unwrap();

    let mut seen = HashSet::new();
    for _ in 0..50 {
        seen.insert(sampler.sample(&logits, &[]).unwrap().unwrap().token);
    }

    assert!(seen.iter().all(|t| *t == 3 || *t == 4), "got {seen:?}");
}

#[test]
fn test_top_p_sampling() {
    let config = GenerationConfig {
        top_p: 0.5,
        ..sampling_config()
    };
    let mut sampler = Sampler::with_seed(&config, 7);
    let logits = Tensor::new(&[10.0f32, 0.0, 0.0, 0.0, 0.0], &test_device()).unwrap();

    for _ in 0..50 {
        let sampled = sampler.sample(&logits, &[]).unwrap().unwrap();
        assert_eq!(sampled.token, 0);
        // Nucleus of one token renormalizes to probability 1
        assert!(sampled.log_prob.abs() < 1e-6);
    }
}

#[test]
fn test_seeded_sampling_is_reproducible() {
    let logits = Tensor::new(&[0.5f32, 1.0, 1.5, 0.2, 0.9, 1.1], &test_device()).unwrap();

    let mut a = Sampler::with_seed(&sampling_config(), 1234);
    let mut b = Sampler::with_seed(&sampling_config(), 1234);

    let draw = |sampler: &mut Sampler| sampler.sample(&logits, &[]).unwrap().unwrap().token;
    let run_a: Vec<u32> = (0..30).map(|_| draw(&mut a)).collect();
    let run_b: Vec<u32> = (0..30).map(|_| draw(&mut b)).collect();
    assert_eq!(run_a, run_b);
}

#[test]
fn test_rng_seed_in_config() {
    let config = GenerationConfig {
        rng_seed: Some(99),
        ..sampling_config()
    };
    let logits = Tensor::new(&[0.5f32, 1.0, 1.5, 0.2], &test_device()).unwrap();

    let mut a = Sampler::new(&config);
    let mut b = Sampler::with_seed(&config, 99);
    for _ in 0..20 {
        assert_eq!(
            a.sample(&logits, &[]).unwrap().unwrap().token,
            b.sample(&logits, &[]).unwrap().unwrap().token
        );
    }
}

#[test]
fn test_repetition_penalty_changes_greedy_choice() {
    let config = GenerationConfig {
        repetition_penalty: 2.0,
        ..GenerationConfig::greedy()
    };
    let mut sampler = Sampler::with_seed(&config, 0);

    // Token 0 was already generated: 2.0 / 2.0 = 1.0 < 1.9
    let sampled = sampler.select(vec![2.0, 1.9], &[0]).unwrap().unwrap();
    assert_eq!(sampled.token, 1);
}

#[test]
fn test_no_repeat_ngram_bans_continuation() {
    let config = GenerationConfig {
        no_repeat_ngram_size: Some(2),
        ..GenerationConfig::greedy()
    };
    let mut sampler = Sampler::with_seed(&config, 0);

    // History ends in 1 and already contains the bigram (1, 2)
    let sampled = sampler
        .select(vec![0.0, 0.0, 5.0, 1.0], &[1, 2, 1])
        .unwrap()
        .unwrap();
    assert_eq!(sampled.token, 3);
}

#[test]
fn test_empty_logits_is_error() {
    let mut sampler = Sampler::with_seed(&GenerationConfig::greedy(), 0);
    assert!(sampler.select(Vec::new(), &[]).is_err());
}
