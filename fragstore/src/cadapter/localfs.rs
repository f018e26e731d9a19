//! 本地文件目录模拟存储节点：每个节点地址一个子目录，块文件位于 `<root>/<address>/blocks/<id>`。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{fs, io::AsyncWriteExt};

use crate::cadapter::client::DataClient;
use crate::chunk::model::BlockMd;
use crate::error::{Error, Result};

pub struct LocalFsNodes {
    root: PathBuf,
}

impl LocalFsNodes {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, block: &BlockMd) -> Result<PathBuf> {
        // 地址和块 id 都作为单个路径分量使用
        let safe = |s: &str| !s.is_empty() && !s.contains(['/', '\\']) && s != "." && s != "..";
        if !safe(&block.address) || !safe(&block.id) {
            return Err(Error::InvalidArgument(format!(
                "bad block location {}@{}",
                block.id, block.address
            )));
        }
        Ok(self.root.join(&block.address).join("blocks").join(&block.id))
    }
}

#[async_trait]
impl DataClient for LocalFsNodes {
    async fn write_block(&self, block: &BlockMd, data: Bytes) -> Result<()> {
        let path = self.path_for(block)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let mut f = fs::File::create(path).await?;
        f.write_all(&data).await?;
        f.flush().await?;
        Ok(())
    }

    async fn read_block(&self, block: &BlockMd) -> Result<Bytes> {
        let path = self.path_for(block)?;
        match fs::read(path).await {
            Ok(buf) => Ok(Bytes::from(buf)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound(format!(
                "block {}@{}",
                block.id, block.address
            ))),
            Err(e) => Err(e.into()),
        }
    }
}
