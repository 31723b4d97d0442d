use std::fs;

use anyhow::Result;
use graph_io::io::{save_npy, NpyReader};
use graph_io::ops::{functional, LoadFromDisk, Op, Value};
use graph_io::telemetry::init_tracing;
use graph_io::{BroadcastPattern, DType, GraphBuilder, MmapMode, OpError, Shape, Tensor};
use tempfile::tempdir;

fn load_once(op: LoadFromDisk, path: &std::path::Path) -> Result<Tensor, OpError> {
    let mut outputs = op.perform(vec![Value::from(path.to_path_buf())])?;
    outputs.remove(0).into_tensor()
}

#[test]
fn loader_construction_accepts_only_known_modes() {
    for dtype in DType::ALL {
        for pattern in [
            BroadcastPattern::vector(),
            BroadcastPattern::matrix(),
            BroadcastPattern::column(),
            BroadcastPattern::dense(0),
        ] {
            for mode in [None, Some("c")] {
                let op = LoadFromDisk::with_mode_str(dtype, pattern.clone(), mode).unwrap();
                assert_eq!(op.dtype(), dtype);
            }
            for mode in ["r", "r+", "w+", ""] {
                let err =
                    LoadFromDisk::with_mode_str(dtype, pattern.clone(), Some(mode)).unwrap_err();
                assert!(matches!(err, OpError::Config(_)), "{mode:?} gave {err}");
            }
        }
    }
}

#[test]
fn matching_dtype_loads_with_consistent_shape() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("matrix.npy");
    let stored = Tensor::from_vec(Shape::new([2, 3]), vec![1.5f64, -2.0, 0.0, 4.25, 8.0, 9.5])?;
    save_npy(&path, &stored)?;

    for mode in [MmapMode::None, MmapMode::CopyOnWrite] {
        let tensor = load_once(
            LoadFromDisk::new(DType::F64, BroadcastPattern::matrix(), mode),
            &path,
        )?;
        assert_eq!(tensor.dtype(), DType::F64);
        assert!(BroadcastPattern::matrix().admits(tensor.shape()));
        assert_eq!(tensor.shape().dims(), &[2, 3]);
        assert_eq!(tensor.to_vec::<f64>()?, stored.to_vec::<f64>()?);
        assert_eq!(tensor.is_mapped(), mode == MmapMode::CopyOnWrite);
    }
    Ok(())
}

#[test]
fn copy_on_write_load_leaves_the_file_untouched() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("ids.npy");
    save_npy(&path, &Tensor::from_vec(Shape::new([4]), vec![10i64, 20, 30, 40])?)?;
    let before = fs::read(&path)?;

    let tensor = load_once(
        LoadFromDisk::new(DType::I64, BroadcastPattern::vector(), MmapMode::CopyOnWrite),
        &path,
    )?;
    assert_eq!(tensor.to_vec::<i64>()?, vec![10, 20, 30, 40]);
    drop(tensor);
    assert_eq!(fs::read(&path)?, before);
    Ok(())
}

#[test]
fn mismatched_dtype_is_a_type_error() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("floats.npy");
    save_npy(&path, &Tensor::from_vec(Shape::new([3]), vec![1.0f32, 2.0, 3.0])?)?;

    let err = load_once(
        LoadFromDisk::new(DType::I64, BroadcastPattern::vector(), MmapMode::None),
        &path,
    )
    .unwrap_err();
    assert!(matches!(err, OpError::TypeMismatch { .. }));
    assert_eq!(
        err.to_string(),
        "expected an array of type int64, got float32 instead"
    );
    Ok(())
}

#[test]
fn archive_extension_fails_regardless_of_contents() -> Result<()> {
    let dir = tempdir()?;
    // Perfectly valid .npy payloads under archive names, including a bare ".npz".
    for name in ["bundle.npz", ".npz", "weights.v2.npz"] {
        let path = dir.path().join(name);
        save_npy(&path, &Tensor::from_vec(Shape::new([1]), vec![7u8])?)?;

        for mode in [MmapMode::None, MmapMode::CopyOnWrite] {
            let err = load_once(
                LoadFromDisk::new(DType::U8, BroadcastPattern::vector(), mode),
                &path,
            )
            .unwrap_err();
            assert!(matches!(err, OpError::Format(_)), "{name}: {err}");
        }
    }
    Ok(())
}

#[test]
fn corrupt_files_are_format_errors() -> Result<()> {
    let dir = tempdir()?;
    let bad_magic = dir.path().join("bad.npy");
    fs::write(&bad_magic, b"NOTNUMPY-at-all")?;
    assert!(matches!(NpyReader::open(&bad_magic), Err(OpError::Format(_))));

    let truncated = dir.path().join("short.npy");
    save_npy(&truncated, &Tensor::from_vec(Shape::new([8]), vec![0i32; 8])?)?;
    let bytes = fs::read(&truncated)?;
    fs::write(&truncated, &bytes[..bytes.len() - 4])?;
    for mode in [MmapMode::None, MmapMode::CopyOnWrite] {
        let err = load_once(
            LoadFromDisk::new(DType::I32, BroadcastPattern::vector(), mode),
            &truncated,
        )
        .unwrap_err();
        assert!(matches!(err, OpError::Format(_)), "{mode}: {err}");
    }

    let missing = dir.path().join("missing.npy");
    assert!(matches!(
        load_once(
            LoadFromDisk::new(DType::I32, BroadcastPattern::vector(), MmapMode::None),
            &missing
        ),
        Err(OpError::Io(_))
    ));
    Ok(())
}

#[test]
fn loader_runs_inside_a_graph() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("bias.npy");
    save_npy(&path, &Tensor::from_vec(Shape::new([3, 1]), vec![1u16, 2, 3])?)?;

    let mut builder = GraphBuilder::new();
    let input = builder.path_input();
    let loaded = functional::load(
        &mut builder,
        input,
        DType::U16,
        BroadcastPattern::column(),
        MmapMode::None,
    )?;
    let graph = builder.build(&[loaded])?;

    for _ in 0..2 {
        let outputs = graph.run(vec![(input, Value::from(path.clone()))])?;
        let tensor = outputs.into_iter().next().expect("one output").into_tensor()?;
        assert_eq!(tensor.to_vec::<u16>()?, vec![1, 2, 3]);
    }
    Ok(())
}

#[test]
fn scalar_arrays_roundtrip() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("scalar.npy");
    save_npy(&path, &Tensor::from_vec(Shape::scalar(), vec![true])?)?;

    let reader = NpyReader::open(&path)?;
    assert_eq!(reader.header().descr, "|b1");
    assert_eq!(reader.header().shape.rank(), 0);

    let tensor = load_once(
        LoadFromDisk::new(DType::Bool, BroadcastPattern::dense(0), MmapMode::CopyOnWrite),
        &path,
    )?;
    assert_eq!(tensor.to_vec::<bool>()?, vec![true]);
    Ok(())
}
