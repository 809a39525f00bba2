pub mod proto {
    pub mod isolate {
        pub mod v1 {
            tonic::include_proto!("isolate.v1");
        }
    }

    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("isolate");
}
