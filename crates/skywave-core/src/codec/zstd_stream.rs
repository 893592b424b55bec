//! Waterfall row compression.
//!
//! Each waterfall connection owns one of these: the quantized row is CBOR
//! framed as a `WaterfallPacket`, then pushed through a persistent zstd
//! context flushed per packet, so the dictionary window carries across the
//! rows of one stream and successive near-identical lines compress well.

use crate::protocol::WaterfallPacket;
use zstd_safe::{CCtx, InBuffer, OutBuffer};

const COMPRESSION_LEVEL: i32 = 3;

pub struct WaterfallStreamEncoder {
    cctx: CCtx<'static>,
}

impl WaterfallStreamEncoder {
    pub fn new() -> anyhow::Result<Self> {
        let mut cctx = CCtx::create();
        map_zstd(
            cctx.set_parameter(zstd_safe::CParameter::CompressionLevel(COMPRESSION_LEVEL)),
            "set zstd compression level",
        )?;
        Ok(Self { cctx })
    }

    /// One wire packet for one quantized row. `l` and `r` are indices at
    /// the row's own downsample level; the packet publishes them scaled
    /// back to level-0 bin coordinates.
    pub fn encode_row(
        &mut self,
        frame_num: u64,
        level: usize,
        l: usize,
        r: usize,
        row: &[i8],
    ) -> anyhow::Result<Vec<u8>> {
        let pkt = WaterfallPacket {
            frame_num,
            l: (l << level) as i32,
            r: (r << level) as i32,
            data: bytemuck::cast_slice::<i8, u8>(row),
        };
        let cbor = serde_cbor::to_vec(&pkt)?;
        self.compress_flush(&cbor)
    }

    fn compress_flush(&mut self, input: &[u8]) -> anyhow::Result<Vec<u8>> {
        let max = zstd_safe::compress_bound(input.len());
        let mut out = vec![0u8; max.max(64)];

        let mut in_buf = InBuffer::around(input);
        let pos = {
            let mut out_buf = OutBuffer::around(&mut out[..]);
            map_zstd(
                self.cctx.compress_stream2(
                    &mut out_buf,
                    &mut in_buf,
                    zstd_safe::zstd_sys::ZSTD_EndDirective::ZSTD_e_flush,
                ),
                "zstd compress_stream2 flush",
            )?;
            out_buf.pos()
        };
        out.truncate(pos);
        Ok(out)
    }
}

fn map_zstd(res: zstd_safe::SafeResult, ctx: &'static str) -> anyhow::Result<usize> {
    res.map_err(|code| anyhow::anyhow!("{ctx} (zstd error code {code:?})"))
}
