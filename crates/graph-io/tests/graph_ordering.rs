use anyhow::Result;
use graph_io::ops::{functional, OpKind, ReceiveWait, SendWait};
use graph_io::transport::LocalWorld;
use graph_io::{DType, GraphBuilder, OpError, PeerAddress, Shape, Tensor, ValueId};

#[test]
fn wait_cannot_precede_its_start() -> Result<()> {
    let mut builder = GraphBuilder::new();
    // No start node has produced a handle yet, so there is nothing to wait on.
    for id in 0..4 {
        assert!(matches!(
            builder.make_node(ReceiveWait, &[ValueId(id)]),
            Err(OpError::Graph(_))
        ));
        assert!(functional::wait(&mut builder, ValueId(id)).is_err());
    }
    Ok(())
}

#[test]
fn recorded_order_places_every_start_before_its_wait() -> Result<()> {
    let context = LocalWorld::new(2)?.into_contexts().remove(0);
    let mut builder = GraphBuilder::new();

    let first = functional::irecv(
        &mut builder,
        &context,
        PeerAddress::new(1, 0),
        DType::F32,
        Shape::new([4]),
    )?;
    let data = builder.tensor_constant(Tensor::from_vec(Shape::new([2]), vec![1i32, 2])?);
    let second = functional::isend(&mut builder, &context, data, PeerAddress::new(1, 1))?;
    let ack = functional::wait(&mut builder, second)?;
    let received = functional::wait(&mut builder, first)?;
    let graph = builder.build(&[received, ack])?;

    let kinds: Vec<&str> = graph
        .ops()
        .map(|op| match op {
            OpKind::Load(_) => "load",
            OpKind::ReceiveStart(_) => "recv",
            OpKind::SendStart(_) => "send",
            OpKind::ReceiveWait(_) => "recv-wait",
            OpKind::SendWait(_) => "send-wait",
        })
        .collect();
    assert_eq!(kinds, ["recv", "send", "send-wait", "recv-wait"]);
    Ok(())
}

#[test]
fn tensors_are_not_handles() -> Result<()> {
    let mut builder = GraphBuilder::new();
    let tensor = builder.tensor_constant(Tensor::from_vec(Shape::new([3]), vec![1i64, 2, 3])?);
    let err = builder.make_node(SendWait, &[tensor]).unwrap_err();
    assert!(err.to_string().contains("expects a send handle"));
    assert!(functional::wait(&mut builder, tensor).is_err());
    Ok(())
}

#[test]
fn forgotten_waits_fail_the_build() -> Result<()> {
    let context = LocalWorld::new(2)?.into_contexts().remove(1);
    let mut builder = GraphBuilder::new();
    let data = builder.tensor_constant(Tensor::from_vec(Shape::new([1]), vec![0.5f64])?);
    functional::isend(&mut builder, &context, data, PeerAddress::new(0, 2))?;
    let err = builder.build(&[data]).unwrap_err();
    assert!(err.to_string().contains("Send{dest: 0, tag: 2}"));
    Ok(())
}
