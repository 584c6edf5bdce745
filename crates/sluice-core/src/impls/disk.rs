//! Disk - ファイル実装が共有する書き込み処理
//!
//! - `file_stem`: 任意の名前から固定長のファイル名を作る
//! - `write_atomic`: 一時ファイル → fsync → rename → ディレクトリ fsync

use std::io;
use std::path::Path;

use tokio::io::AsyncWriteExt;
use ulid::Ulid;

/// 名前の blake3 ダイジェストを hex にしたもの（常に 64 文字）
///
/// 名前の長さやパス区切りに関係なく、ディレクトリの外に出ず NAME_MAX にも収まる。
/// 元の名前はファイルの中身に持たせること。
pub(crate) fn file_stem(name: &str) -> String {
    hex::encode(blake3::hash(name.as_bytes()).as_bytes())
}

/// `path` を `bytes` で置き換える
///
/// 戻った時点で中身とディレクトリエントリの両方がディスクに載っている。
/// 途中で落ちても `path` は古い中身か新しい中身のどちらかになる。
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    tokio::fs::create_dir_all(dir).await?;

    let tmp = dir.join(format!(".{}.tmp", Ulid::new()));
    if let Err(e) = write_synced(&tmp, bytes).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }

    sync_dir(dir).await
}

async fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}

/// rename / unlink をディスクに反映させる
pub(crate) async fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        tokio::fs::File::open(dir).await?.sync_all().await?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}
