//! Wires the health, reflection, and `Isolate` services onto one
//! `tonic` server, the way the reference codebase's own `grpcapi`
//! modules bootstrap a gRPC-only listener.

use std::net::SocketAddr;

use isolate_api_grpc::proto::isolate::v1::isolate_server::IsolateServer;
use isolate_api_grpc::proto::FILE_DESCRIPTOR_SET;
use tonic::codec::CompressionEncoding;
use tonic::transport::{Error, Server};
use tracing::info;

use crate::servicer::IsolateGrpcApi;

pub async fn start_grpc_server(addr: SocketAddr, api: IsolateGrpcApi) -> Result<(), Error> {
    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<IsolateServer<IsolateGrpcApi>>()
        .await;

    let reflection_service = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()
        .expect("file descriptor set is valid");

    info!(%addr, "starting isolate gRPC server");

    Server::builder()
        .add_service(reflection_service)
        .add_service(health_service)
        .add_service(
            IsolateServer::new(api)
                .send_compressed(CompressionEncoding::Gzip)
                .accept_compressed(CompressionEncoding::Gzip),
        )
        .serve(addr)
        .await
}
