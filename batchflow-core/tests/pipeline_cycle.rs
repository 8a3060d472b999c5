//! Feed / prefetch / run / output behaviour of whole pipelines

mod common;

use batchflow_core::builtin::{EXTERNAL_SOURCE, MAKE_CONTIGUOUS};
use batchflow_core::{
    Backend, Buffer, ConfigOverrides, DataType, Error, ErrorKind, ExternalBatch, FeedOptions,
    GraphDef, OperatorDef, OutputDef, Pipeline, QueueDepth,
};
use common::{config, counter_graph, hwc_batch, setup, FAIL_AT};
use proptest::prelude::*;
use test_case::test_case;

fn counter_pipeline(batch: usize, queue: QueueDepth, pipelined: bool, async_execution: bool) -> Pipeline {
    setup();
    let def = counter_graph(config(batch, queue, pipelined, async_execution));
    Pipeline::new(&def, &ConfigOverrides::default()).unwrap()
}

#[test]
fn test_batch_of_eight_with_depth_two() {
    let mut pipe = counter_pipeline(8, QueueDepth::Uniform(2), true, true);
    assert_eq!(pipe.input_feed_count("src").unwrap(), 2);

    pipe.feed_input("src", hwc_batch(8, 10), FeedOptions::default()).unwrap();
    let err = pipe.prefetch().unwrap_err();
    assert!(matches!(err, Error::UnderFed { fed: 1, required: 2, .. }));
    assert_eq!(err.kind(), ErrorKind::Configuration);

    pipe.feed_input("src", hwc_batch(8, 20), FeedOptions::default()).unwrap();
    pipe.prefetch().unwrap();

    let out = pipe.output().unwrap();
    assert_eq!(out.iteration, 0);
    assert_eq!(pipe.num_outputs(), 1);
    assert!(pipe.output_has_uniform_shape(0).unwrap());
    assert_eq!(pipe.output_shape(0).unwrap(), Some(vec![8, 2, 2, 3]));
    assert_eq!(pipe.output_layout(0).unwrap().as_str(), "HWC");
    assert_eq!(pipe.output_tensor(0).unwrap().sample(7).unwrap(), &[10u8; 12][..]);
}

#[test]
fn test_overfeeding_before_prefetch_is_rejected() {
    let mut pipe = counter_pipeline(2, QueueDepth::Uniform(1), true, true);
    for fill in 0..2 {
        pipe.feed_input("src", hwc_batch(2, fill), FeedOptions::default()).unwrap();
    }
    assert!(matches!(pipe.prefetch(), Err(Error::OverFed { fed: 2, required: 1, .. })));
}

#[test]
fn test_output_before_scheduling_is_a_sequencing_error() {
    let mut pipe = counter_pipeline(2, QueueDepth::Uniform(2), true, true);
    let err = pipe.output().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Sequencing);
}

#[test]
fn test_run_without_feed_is_rejected() {
    let mut pipe = counter_pipeline(2, QueueDepth::Uniform(2), true, false);
    assert!(matches!(pipe.run(), Err(Error::UnderFed { .. })));
}

#[test]
fn test_mismatched_feed_is_rejected_at_feed_time() {
    let mut pipe = counter_pipeline(4, QueueDepth::Uniform(2), true, true);
    let wrong_dtype = ExternalBatch::contiguous(
        Buffer::from_vec(vec![0; 4 * 48]),
        &vec![vec![2, 2, 3]; 4],
        DataType::Float32,
    );
    assert!(matches!(
        pipe.feed_input("src", wrong_dtype, FeedOptions::default()),
        Err(Error::FeedMismatch { .. })
    ));
    assert!(matches!(
        pipe.feed_input("src", hwc_batch(3, 0), FeedOptions::default()),
        Err(Error::FeedMismatch { .. })
    ));

    pipe.set_external_input_batch_size("src", 3).unwrap();
    pipe.feed_input("src", hwc_batch(3, 0), FeedOptions::default()).unwrap();
    pipe.run().unwrap();
    assert_eq!(pipe.output().unwrap().outputs[0].num_samples(), 3);
}

#[test_case(QueueDepth::Uniform(2), true, true ; "uniform async")]
#[test_case(QueueDepth::Uniform(2), true, false ; "uniform sync pipelined")]
#[test_case(QueueDepth::Uniform(1), false, false ; "serial")]
#[test_case(QueueDepth::Separated { cpu: 2, gpu: 1 }, true, true ; "separated async")]
#[test_case(QueueDepth::Separated { cpu: 1, gpu: 2 }, true, false ; "separated sync")]
fn test_steady_state_cycle(queue: QueueDepth, pipelined: bool, async_execution: bool) {
    let mut pipe = counter_pipeline(4, queue, pipelined, async_execution);
    let depth = pipe.input_feed_count("src").unwrap();
    for k in 0..depth {
        pipe.feed_input("src", hwc_batch(4, k as u8 * 10), FeedOptions::default()).unwrap();
    }
    pipe.prefetch().unwrap();

    for k in 0..6usize {
        let out = pipe.output().unwrap();
        assert_eq!(out.iteration, k as u64);
        let expected = (k as u8 * 10).wrapping_add(k as u8);
        assert!(out.outputs[0].sample(0).unwrap().iter().all(|&b| b == expected));

        let next = depth + k;
        pipe.feed_input("src", hwc_batch(4, next as u8 * 10), FeedOptions::default()).unwrap();
        pipe.run().unwrap();
    }
}

#[test]
fn test_cpu_only_pipeline_runs_without_stream() {
    setup();
    let mut cfg = config(2, QueueDepth::Uniform(2), true, false);
    cfg.device_id = -1;
    let mut pipe = Pipeline::new(&counter_graph(cfg), &ConfigOverrides::default()).unwrap();
    pipe.feed_input("src", hwc_batch(2, 1), FeedOptions::default()).unwrap();
    pipe.run().unwrap();
    assert_eq!(pipe.output().unwrap().outputs[0].sample(1).unwrap()[0], 1);
}

#[test]
fn test_cpu_only_pipeline_rejects_device_operators() {
    setup();
    let mut cfg = config(2, QueueDepth::Uniform(2), true, true);
    cfg.device_id = -1;
    let def = counter_graph(cfg)
        .operator(
            OperatorDef::new("upload", MAKE_CONTIGUOUS, Backend::Mixed)
                .input("out")
                .output(OutputDef::new("out_gpu")),
        )
        .pipeline_output("out_gpu");
    let err = Pipeline::new(&def, &ConfigOverrides::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn test_device_output_and_backend_query() {
    setup();
    let def = counter_graph(config(2, QueueDepth::Uniform(2), true, true))
        .operator(
            OperatorDef::new("upload", MAKE_CONTIGUOUS, Backend::Mixed)
                .input("out")
                .output(OutputDef::new("out_gpu")),
        )
        .pipeline_output("out_gpu");
    let mut pipe = Pipeline::new(&def, &ConfigOverrides::default()).unwrap();
    assert_eq!(pipe.num_outputs(), 2);
    assert_eq!(pipe.output_device(1).unwrap(), batchflow_core::StorageDevice::Gpu);
    assert_eq!(pipe.operator_backend("upload").unwrap(), Backend::Mixed);
    assert!(matches!(pipe.operator_backend("missing"), Err(Error::UnknownName(_))));

    pipe.feed_input("src", hwc_batch(2, 4), FeedOptions::default()).unwrap();
    pipe.run().unwrap();
    let out = pipe.output().unwrap();
    assert_eq!(out.outputs[1].memory(), batchflow_core::MemoryKind::Device(0));
    assert_eq!(out.outputs[1].sample(0).unwrap(), out.outputs[0].sample(0).unwrap());
}

#[test]
fn test_force_no_copy_feed_is_observed_in_place() {
    setup();
    let def = GraphDef::new(config(2, QueueDepth::Uniform(2), true, true))
        .operator(OperatorDef::new("src", EXTERNAL_SOURCE, Backend::Cpu).output(OutputDef::new("raw")))
        .operator(
            OperatorDef::new("pack", MAKE_CONTIGUOUS, Backend::Cpu)
                .input("raw")
                .output(OutputDef::new("packed")),
        )
        .pipeline_output("packed");
    let mut pipe = Pipeline::new(&def, &ConfigOverrides::default()).unwrap();

    let caller = Buffer::from_vec((0..24).collect());
    let batch = ExternalBatch::contiguous(caller.clone(), &[vec![12], vec![12]], DataType::UInt8);
    pipe.feed_input("src", batch, FeedOptions::default().force_no_copy()).unwrap();
    pipe.run().unwrap();
    let out = pipe.output().unwrap();
    assert!(out.outputs[0].contiguous_buffer().unwrap().same_region(&caller));

    // A copied feed lands in pool memory instead
    let batch = ExternalBatch::contiguous(caller.clone(), &[vec![12], vec![12]], DataType::UInt8);
    pipe.feed_input("src", batch, FeedOptions::default().force_copy()).unwrap();
    pipe.run().unwrap();
    let out = pipe.output().unwrap();
    assert!(!out.outputs[0].contiguous_buffer().unwrap().same_region(&caller));
    assert_eq!(out.outputs[0].sample(1).unwrap()[0], 12);
}

#[test]
fn test_operator_failure_surfaces_and_poisons() {
    setup();
    let def = counter_graph(config(2, QueueDepth::Uniform(2), true, false))
        .operator(
            OperatorDef::new("check", FAIL_AT, Backend::Cpu)
                .arg("iteration", 1)
                .input("out")
                .output(OutputDef::new("checked")),
        )
        .pipeline_output("checked");
    let mut pipe = Pipeline::new(&def, &ConfigOverrides::default()).unwrap();
    for fill in 0..3 {
        pipe.feed_input("src", hwc_batch(2, fill), FeedOptions::default()).unwrap();
    }
    pipe.run().unwrap();
    pipe.output().unwrap();
    pipe.run().unwrap();

    let err = pipe.output().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Operator);
    match err {
        Error::Operator(failure) => {
            assert_eq!(failure.operator, "check");
            assert_eq!(failure.iteration, 1);
            assert!(failure.message.contains("corrupt sample"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(matches!(pipe.run(), Err(Error::Operator(_))));
}

#[test]
fn test_share_output_holds_up_to_depth() {
    let mut pipe = counter_pipeline(2, QueueDepth::Uniform(2), true, true);
    for fill in 0..2 {
        pipe.feed_input("src", hwc_batch(2, fill), FeedOptions::default()).unwrap();
    }
    pipe.prefetch().unwrap();
    pipe.feed_input("src", hwc_batch(2, 9), FeedOptions::default()).unwrap();
    pipe.run().unwrap();

    assert_eq!(pipe.share_output().unwrap().iteration, 0);
    assert_eq!(pipe.share_output().unwrap().iteration, 1);
    assert_eq!(pipe.held_outputs(), 2);
    assert_eq!(pipe.share_output().unwrap_err().kind(), ErrorKind::Sequencing);

    // Introspection looks at the newest held output
    assert_eq!(pipe.current().unwrap().iteration, 1);

    pipe.release_output().unwrap();
    assert_eq!(pipe.share_output().unwrap().iteration, 2);
    pipe.release_output().unwrap();
    pipe.release_output().unwrap();
    assert_eq!(pipe.release_output().unwrap_err().kind(), ErrorKind::Sequencing);
    assert_eq!(pipe.output_nbytes(0).unwrap_err().kind(), ErrorKind::Sequencing);
}

#[test]
fn test_backpressure_never_exceeds_depth() {
    let mut pipe = counter_pipeline(2, QueueDepth::Separated { cpu: 2, gpu: 1 }, true, true);
    let depth = pipe.input_feed_count("src").unwrap();
    assert_eq!(depth, 3);
    for fill in 0..depth {
        pipe.feed_input("src", hwc_batch(2, fill as u8), FeedOptions::default()).unwrap();
    }
    pipe.prefetch().unwrap();
    for fill in 0..5 {
        pipe.feed_input("src", hwc_batch(2, fill), FeedOptions::default()).unwrap();
        pipe.run().unwrap();
    }
    for _ in 0..8 {
        pipe.output().unwrap();
        for stats in pipe.queue_stats() {
            assert!(stats.peak_in_flight <= stats.depth, "{stats:?}");
        }
    }
}

#[test]
fn test_traces_and_reader_metadata_queries() {
    let mut pipe = counter_pipeline(2, QueueDepth::Uniform(2), true, true);
    pipe.set_external_input_data_id("src", "shard-0/row-16").unwrap();
    pipe.feed_input("src", hwc_batch(2, 0), FeedOptions::default()).unwrap();
    pipe.feed_input("src", hwc_batch(2, 0), FeedOptions::default()).unwrap();
    pipe.run().unwrap();
    pipe.run().unwrap();

    pipe.output().unwrap();
    assert!(pipe.has_operator_trace("src", "next_output_data_id").unwrap());
    assert_eq!(pipe.operator_trace("src", "next_output_data_id").unwrap(), "shard-0/row-16");
    assert!(!pipe.has_operator_trace("add", "next_output_data_id").unwrap());
    assert!(matches!(pipe.has_operator_trace("ghost", "k"), Err(Error::UnknownName(_))));

    // Traces belong to one iteration only
    pipe.output().unwrap();
    assert!(!pipe.has_operator_trace("src", "next_output_data_id").unwrap());

    assert!(matches!(pipe.reader_metadata("add"), Err(Error::InvalidArgument(_))));
}

#[test]
fn test_memory_statistics_follow_the_toggle() {
    setup();
    let overrides = ConfigOverrides {
        enable_memory_stats: Some(true),
        ..ConfigOverrides::default()
    };
    let def = counter_graph(config(2, QueueDepth::Uniform(2), true, true));
    let mut pipe = Pipeline::new(&def, &overrides).unwrap();
    pipe.feed_input("src", hwc_batch(2, 0), FeedOptions::default()).unwrap();
    pipe.run().unwrap();
    pipe.output().unwrap();

    let stats = pipe.executor_metadata();
    let add = stats.iter().find(|s| s.operator == "add").unwrap();
    assert_eq!(add.outputs[0].real_size, 24);
    assert_eq!(add.outputs[0].max_real_size, 12);
    assert!(add.outputs[0].reserved >= 24);

    let quiet = counter_pipeline(2, QueueDepth::Uniform(2), true, true);
    assert!(quiet.executor_metadata().is_empty());
}

#[test]
fn test_serialized_graph_round_trip() {
    setup();
    let def = counter_graph(config(4, QueueDepth::Uniform(3), true, true));
    let json = def.to_json().unwrap();
    assert!(batchflow_core::is_deserializable(&json));
    assert!(!batchflow_core::is_deserializable("{\"version\": 1, \"operators\": 7}"));

    let pipe = Pipeline::deserialize_default(&json).unwrap();
    assert_eq!(pipe.max_batch_size(), 4);
    assert_eq!(pipe.input_feed_count("src").unwrap(), 3);

    let overrides = ConfigOverrides {
        max_batch_size: Some(16),
        ..ConfigOverrides::default()
    };
    let pipe = Pipeline::from_serialized(&json, &overrides).unwrap();
    assert_eq!(pipe.max_batch_size(), 16);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_outputs_follow_run_order(
        fills in proptest::collection::vec(any::<u8>(), 1..10),
        async_execution in any::<bool>(),
        separated in any::<bool>(),
    ) {
        let queue = if separated {
            QueueDepth::Separated { cpu: 2, gpu: 2 }
        } else {
            QueueDepth::Uniform(2)
        };
        let mut pipe = counter_pipeline(2, queue, true, async_execution);
        for &fill in &fills {
            pipe.feed_input("src", hwc_batch(2, fill), FeedOptions::default()).unwrap();
            pipe.run().unwrap();
        }
        for (k, &fill) in fills.iter().enumerate() {
            let out = pipe.output().unwrap();
            prop_assert_eq!(out.iteration, k as u64);
            let expected = fill.wrapping_add(k as u8);
            prop_assert!(out.outputs[0].sample(1).unwrap().iter().all(|&b| b == expected));
        }
    }
}
