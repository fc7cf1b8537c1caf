pub mod v1 {
    tonic::include_proto!("messageman.v1");
}
