//! Test doubles shared by the init runner tests

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use mockall::mock;

use dynakube_common::Error;
use dynakube_dtclient::{
    AgentRequest, ClientOptions, ConnectionInfo, DynatraceClient, DynatraceClientBuilder,
    ProcessModuleConfig,
};

mock! {
    pub Client {}

    #[async_trait]
    impl DynatraceClient for Client {
        async fn connection_info(&self) -> Result<ConnectionInfo, Error>;
        async fn process_module_config(
            &self,
            revision: u64,
        ) -> Result<Option<ProcessModuleConfig>, Error>;
        async fn download_agent(&self, request: &AgentRequest, dest: &Path) -> Result<u64, Error>;
        async fn download_agent_from_url(&self, url: &str, dest: &Path) -> Result<u64, Error>;
    }
}

mock! {
    pub Builder {}

    impl DynatraceClientBuilder for Builder {
        fn build(&self, options: ClientOptions) -> Result<Arc<dyn DynatraceClient>, Error>;
    }
}

/// A gzipped tarball holding `files`
pub fn agent_archive(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, contents.as_bytes())
            .unwrap();
    }
    let mut encoder = builder.into_inner().unwrap();
    encoder.flush().unwrap();
    encoder.finish().unwrap()
}

/// The minimal code-module layout the runner relies on
pub fn minimal_agent() -> Vec<u8> {
    agent_archive(&[
        ("agent/lib64/liboneagentproc.so", "ELF"),
        (
            "agent/conf/ruxitagentproc.conf",
            "# generated\n[general]\nserverAddress {https://old.example/communication}\n",
        ),
        ("agent/conf/standalone.conf", "tenant abc\n"),
    ])
}

/// A client whose downloads write `archive`
pub fn downloading_client(archive: Vec<u8>) -> MockClient {
    let mut client = MockClient::new();
    let len = archive.len() as u64;
    let from_tenant = archive.clone();
    client
        .expect_download_agent()
        .returning(move |_, dest| {
            std::fs::write(dest, &from_tenant).unwrap();
            Ok(len)
        });
    client
        .expect_download_agent_from_url()
        .returning(move |_, dest| {
            std::fs::write(dest, &archive).unwrap();
            Ok(len)
        });
    client
}
