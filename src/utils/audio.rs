use crate::core::io::Storage;
use anyhow::{anyhow, Context, Result};

/// Concatenates stream-based audio (MP3, Opus-in-Ogg pages, raw PCM).
pub fn concat_binary(chunks: &[Vec<u8>]) -> Vec<u8> {
    let total = chunks.iter().map(Vec::len).sum();
    let mut out = Vec::with_capacity(total);
    for chunk in chunks {
        out.extend_from_slice(chunk);
    }
    out
}

struct WavInfo<'a> {
    fmt_content: &'a [u8],
    data: &'a [u8],
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32> {
    let slice = bytes
        .get(at..at + 4)
        .ok_or_else(|| anyhow!("Unexpected end of WAV data at offset {}", at))?;
    Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn scan_wav(bytes: &[u8]) -> Result<WavInfo<'_>> {
    if bytes.get(0..4) != Some(&b"RIFF"[..]) {
        return Err(anyhow!("Not a RIFF file"));
    }
    if bytes.get(8..12) != Some(&b"WAVE"[..]) {
        return Err(anyhow!("Not a WAVE file"));
    }

    let mut fmt_content = None;
    let mut pos = 12;
    while pos + 8 <= bytes.len() {
        let chunk_id = &bytes[pos..pos + 4];
        let chunk_size = read_u32(bytes, pos + 4)? as usize;
        let body_start = pos + 8;
        let body_end = (body_start + chunk_size).min(bytes.len());

        if chunk_id == b"fmt " {
            fmt_content = Some(&bytes[body_start..body_end]);
        } else if chunk_id == b"data" {
            return Ok(WavInfo {
                fmt_content: fmt_content.ok_or_else(|| anyhow!("data chunk before fmt chunk"))?,
                data: &bytes[body_start..body_end],
            });
        }
        // chunks are word aligned
        pos = body_start + chunk_size + (chunk_size & 1);
    }
    Err(anyhow!("Missing data chunk"))
}

/// Merges WAV chunks by concatenating their data sections under one header.
/// All chunks must share the same fmt block.
pub fn merge_wav(chunks: &[Vec<u8>]) -> Result<Vec<u8>> {
    let non_empty: Vec<&Vec<u8>> = chunks.iter().filter(|c| !c.is_empty()).collect();
    let Some(first) = non_empty.first() else {
        return Ok(Vec::new());
    };

    let base = scan_wav(first)?;
    let mut infos = Vec::with_capacity(non_empty.len());
    for (i, chunk) in non_empty.iter().enumerate() {
        let info = scan_wav(chunk).with_context(|| format!("Failed to parse WAV chunk {}", i))?;
        if info.fmt_content != base.fmt_content {
            return Err(anyhow!(
                "WAV format mismatch in chunk {}. All segments must have same sample rate/channels.",
                i
            ));
        }
        infos.push(info);
    }

    let total_data: usize = infos.iter().map(|i| i.data.len()).sum();
    let fmt_len = base.fmt_content.len();
    let mut out = Vec::with_capacity(12 + 8 + fmt_len + 8 + total_data);

    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&((4 + 8 + fmt_len + 8 + total_data) as u32).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&(fmt_len as u32).to_le_bytes());
    out.extend_from_slice(base.fmt_content);
    out.extend_from_slice(b"data");
    out.extend_from_slice(&(total_data as u32).to_le_bytes());
    for info in &infos {
        out.extend_from_slice(info.data);
    }
    Ok(out)
}

/// Reads `inputs` in order from storage and writes them merged to `output`.
pub async fn merge_audio_files(
    storage: &dyn Storage,
    inputs: &[String],
    output: &str,
    format: &str,
) -> Result<()> {
    let mut chunks = Vec::with_capacity(inputs.len());
    for input in inputs {
        chunks.push(storage.read(input).await?);
    }

    let merged = if format.eq_ignore_ascii_case("wav") {
        merge_wav(&chunks)?
    } else {
        concat_binary(&chunks)
    };
    storage.write(output, &merged).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;

    fn create_dummy_wav(size: u32, sample_rate: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"RIFF");
        buf.extend_from_slice(&(36 + size).to_le_bytes());
        buf.extend_from_slice(b"WAVE");

        buf.extend_from_slice(b"fmt ");
        buf.extend_from_slice(&16u32.to_le_bytes());
        // PCM (1), Mono (1), SampleRate, ByteRate, BlockAlign (2), Bits (16)
        buf.extend_from_slice(&1u16.to_le_bytes());
        buf.extend_from_slice(&1u16.to_le_bytes());
        buf.extend_from_slice(&sample_rate.to_le_bytes());
        buf.extend_from_slice(&(sample_rate * 2).to_le_bytes());
        buf.extend_from_slice(&2u16.to_le_bytes());
        buf.extend_from_slice(&16u16.to_le_bytes());

        buf.extend_from_slice(b"data");
        buf.extend_from_slice(&size.to_le_bytes());
        buf.extend_from_slice(&vec![0u8; size as usize]);
        buf
    }

    #[test]
    fn test_merge_wav() -> Result<()> {
        let merged = merge_wav(&[create_dummy_wav(10, 44100), Vec::new(), create_dummy_wav(20, 44100)])?;
        let info = scan_wav(&merged)?;
        assert_eq!(info.data.len(), 30);
        assert_eq!(info.fmt_content.len(), 16);
        Ok(())
    }

    #[test]
    fn test_merge_wav_rejects_mismatch() {
        let result = merge_wav(&[create_dummy_wav(10, 44100), create_dummy_wav(10, 22050)]);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_merge_audio_files_binary() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let storage = NativeStorage::new();
        let path1 = temp_dir.path().join("1.mp3").to_string_lossy().to_string();
        let path2 = temp_dir.path().join("2.mp3").to_string_lossy().to_string();
        let output = temp_dir.path().join("out.mp3").to_string_lossy().to_string();

        storage.write(&path1, b"Hello").await?;
        storage.write(&path2, b"World").await?;
        merge_audio_files(&storage, &[path1, path2], &output, "mp3").await?;

        assert_eq!(storage.read(&output).await?, b"HelloWorld");
        Ok(())
    }
}
