use serde::Serialize;

/// One JSON document per line.
pub async fn write_frame<W, T>(out: &mut W, v: &T) -> eyre::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin + Send,
    T: Serialize + Sync,
{
    use tokio::io::AsyncWriteExt as _;

    out.write_all(format!("{}\n", serde_json::to_string(v)?).as_bytes())
        .await?;
    out.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_are_newline_terminated() -> eyre::Result<()> {
        let mut out: Vec<u8> = vec![];
        write_frame(&mut out, &serde_json::json!({"success": true})).await?;
        write_frame(&mut out, &serde_json::json!({"id": "a\nb"})).await?;
        let text = String::from_utf8(out)?;
        assert_eq!(text.lines().count(), 2, "embedded newlines are escaped");
        assert!(text.ends_with('\n'), "trailing newline");
        Ok(())
    }
}
