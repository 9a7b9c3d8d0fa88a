//! CCITT Group 4 (T.6) encoder
//!
//! Encodes a 1-bit-per-pixel bitmap into the two-dimensional MMR coding
//! CCITTFaxDecode expects with `/K -1`. Pixel convention on input: 1 is
//! black. Output uses the CCITT default photometric sense (0 = white), so
//! the image dictionary needs no `/BlackIs1`.

/// A packed 1bpp bitmap, rows padded to byte boundaries, MSB first,
/// 1 = black ink.
pub struct Bitmap {
    pub width: usize,
    pub height: usize,
    pub rows: Vec<u8>,
}

impl Bitmap {
    pub fn row_bytes(&self) -> usize {
        self.width.div_ceil(8)
    }

    fn pixel(&self, row: &[u8], x: usize) -> bool {
        row[x / 8] & (0x80 >> (x % 8)) != 0
    }

    fn row(&self, y: usize) -> &[u8] {
        let stride = self.row_bytes();
        &self.rows[y * stride..(y + 1) * stride]
    }

    /// Builds from 8-bit grayscale with a midpoint threshold.
    pub fn from_gray(width: usize, height: usize, samples: &[u8]) -> Self {
        let stride = width.div_ceil(8);
        let mut rows = vec![0u8; stride * height];
        for y in 0..height {
            for x in 0..width {
                if samples[y * width + x] < 128 {
                    rows[y * stride + x / 8] |= 0x80 >> (x % 8);
                }
            }
        }
        Self {
            width,
            height,
            rows,
        }
    }
}

struct BitWriter {
    out: Vec<u8>,
    current: u8,
    used: u8,
}

impl BitWriter {
    fn new() -> Self {
        Self {
            out: Vec::new(),
            current: 0,
            used: 0,
        }
    }

    fn put(&mut self, bits: u32, len: u8) {
        for i in (0..len).rev() {
            let bit = (bits >> i) & 1;
            self.current = (self.current << 1) | bit as u8;
            self.used += 1;
            if self.used == 8 {
                self.out.push(self.current);
                self.current = 0;
                self.used = 0;
            }
        }
    }

    fn finish(mut self) -> Vec<u8> {
        if self.used > 0 {
            self.current <<= 8 - self.used;
            self.out.push(self.current);
        }
        self.out
    }
}

/// (code bits, bit length) pairs. Terminating codes index by run length
/// 0..=63; makeup codes cover 64, 128, ... in steps of 64.
type Code = (u32, u8);

#[rustfmt::skip]
const WHITE_TERMINATING: [Code; 64] = [
    (0x35, 8), (0x07, 6), (0x07, 4), (0x08, 4), (0x0B, 4), (0x0C, 4), (0x0E, 4), (0x0F, 4),
    (0x13, 5), (0x14, 5), (0x07, 5), (0x08, 5), (0x08, 6), (0x03, 6), (0x34, 6), (0x35, 6),
    (0x2A, 6), (0x2B, 6), (0x27, 7), (0x0C, 7), (0x08, 7), (0x17, 7), (0x03, 7), (0x04, 7),
    (0x28, 7), (0x2B, 7), (0x13, 7), (0x24, 7), (0x18, 7), (0x02, 8), (0x03, 8), (0x1A, 8),
    (0x1B, 8), (0x12, 8), (0x13, 8), (0x14, 8), (0x15, 8), (0x16, 8), (0x17, 8), (0x28, 8),
    (0x29, 8), (0x2A, 8), (0x2B, 8), (0x2C, 8), (0x2D, 8), (0x04, 8), (0x05, 8), (0x0A, 8),
    (0x0B, 8), (0x52, 8), (0x53, 8), (0x54, 8), (0x55, 8), (0x24, 8), (0x25, 8), (0x58, 8),
    (0x59, 8), (0x5A, 8), (0x5B, 8), (0x4A, 8), (0x4B, 8), (0x32, 8), (0x33, 8), (0x34, 8),
];

#[rustfmt::skip]
const WHITE_MAKEUP: [Code; 27] = [
    (0x1B, 5),  (0x12, 5),  (0x17, 6),  (0x37, 7),  (0x36, 8),  (0x37, 8),  (0x64, 8),
    (0x65, 8),  (0x68, 8),  (0x67, 8),  (0xCC, 9),  (0xCD, 9),  (0xD2, 9),  (0xD3, 9),
    (0xD4, 9),  (0xD5, 9),  (0xD6, 9),  (0xD7, 9),  (0xD8, 9),  (0xD9, 9),  (0xDA, 9),
    (0xDB, 9),  (0x98, 9),  (0x99, 9),  (0x9A, 9),  (0x18, 6),  (0x9B, 9),
];

#[rustfmt::skip]
const BLACK_TERMINATING: [Code; 64] = [
    (0x37, 10), (0x02, 3),  (0x03, 2),  (0x02, 2),  (0x03, 3),  (0x03, 4),  (0x02, 4),  (0x03, 5),
    (0x05, 6),  (0x04, 6),  (0x04, 7),  (0x05, 7),  (0x07, 7),  (0x04, 8),  (0x07, 8),  (0x18, 9),
    (0x17, 10), (0x18, 10), (0x08, 10), (0x67, 11), (0x68, 11), (0x6C, 11), (0x37, 11), (0x28, 11),
    (0x17, 11), (0x18, 11), (0xCA, 12), (0xCB, 12), (0xCC, 12), (0xCD, 12), (0x68, 12), (0x69, 12),
    (0x6A, 12), (0x6B, 12), (0xD2, 12), (0xD3, 12), (0xD4, 12), (0xD5, 12), (0xD6, 12), (0xD7, 12),
    (0x6C, 12), (0x6D, 12), (0xDA, 12), (0xDB, 12), (0x54, 12), (0x55, 12), (0x56, 12), (0x57, 12),
    (0x64, 12), (0x65, 12), (0x52, 12), (0x53, 12), (0x24, 12), (0x37, 12), (0x38, 12), (0x27, 12),
    (0x28, 12), (0x58, 12), (0x59, 12), (0x2B, 12), (0x2C, 12), (0x5A, 12), (0x66, 12), (0x67, 12),
];

#[rustfmt::skip]
const BLACK_MAKEUP: [Code; 27] = [
    (0x0F, 10), (0xC8, 12), (0xC9, 12), (0x5B, 12), (0x33, 12), (0x34, 12), (0x35, 12),
    (0x6C, 13), (0x6D, 13), (0x4A, 13), (0x4B, 13), (0x4C, 13), (0x4D, 13), (0x72, 13),
    (0x73, 13), (0x74, 13), (0x75, 13), (0x76, 13), (0x77, 13), (0x52, 13), (0x53, 13),
    (0x54, 13), (0x55, 13), (0x5A, 13), (0x5B, 13), (0x64, 13), (0x65, 13),
];

/// Extended makeup codes (shared by both colors) for runs 1792..=2560.
#[rustfmt::skip]
const EXTENDED_MAKEUP: [Code; 13] = [
    (0x08, 11), (0x0C, 11), (0x0D, 11), (0x12, 12), (0x13, 12), (0x14, 12), (0x15, 12),
    (0x16, 12), (0x17, 12), (0x1C, 12), (0x1D, 12), (0x1E, 12), (0x1F, 12),
];

fn write_run(writer: &mut BitWriter, mut run: usize, black: bool) {
    // Extended makeup region first, then the color's own makeups, then
    // one terminating code.
    while run >= 2624 {
        let (bits, len) = EXTENDED_MAKEUP[12];
        writer.put(bits, len);
        run -= 2560;
    }
    if run >= 1792 {
        let idx = (run - 1792) / 64;
        let (bits, len) = EXTENDED_MAKEUP[idx.min(12)];
        writer.put(bits, len);
        run -= (idx.min(12) * 64) + 1792;
    }
    if run >= 64 {
        let idx = run / 64 - 1;
        let table = if black { &BLACK_MAKEUP } else { &WHITE_MAKEUP };
        let (bits, len) = table[idx.min(26)];
        writer.put(bits, len);
        run -= (idx.min(26) + 1) * 64;
    }
    let table = if black {
        &BLACK_TERMINATING
    } else {
        &WHITE_TERMINATING
    };
    let (bits, len) = table[run];
    writer.put(bits, len);
}

/// Changing elements of a row: positions where the color differs from the
/// pixel to the left (imaginary white pixel before position 0), with two
/// trailing sentinels at `width`.
fn changes(bitmap: &Bitmap, row: &[u8], out: &mut Vec<usize>) {
    out.clear();
    let mut color = false; // white
    for x in 0..bitmap.width {
        let pixel = bitmap.pixel(row, x);
        if pixel != color {
            out.push(x);
            color = pixel;
        }
    }
    out.push(bitmap.width);
    out.push(bitmap.width);
}

/// Encodes the bitmap as pure two-dimensional (G4) data ending with EOFB.
pub fn encode_g4(bitmap: &Bitmap) -> Vec<u8> {
    let mut writer = BitWriter::new();
    let width = bitmap.width;

    // The reference line above the first row is all white.
    let mut reference: Vec<usize> = vec![width, width];
    let mut current: Vec<usize> = Vec::new();

    for y in 0..bitmap.height {
        let row = bitmap.row(y);
        changes(bitmap, row, &mut current);

        let mut a0: isize = -1;
        let mut color = false; // color of a0, starts white

        loop {
            // a1: the next changing element right of a0 on the coding line.
            let a1 = coding_next(&current, a0, width);
            // b1: first change on the reference line right of a0 that
            // transitions into the opposite of a0's color.
            let b1 = reference_b1(&reference, a0, color, width);
            let b2 = coding_next(&reference, b1 as isize, width);

            if b2 < a1 {
                // Pass mode.
                writer.put(0b0001, 4);
                a0 = b2 as isize;
            } else if (a1 as isize - b1 as isize).abs() <= 3 {
                // Vertical mode.
                match a1 as isize - b1 as isize {
                    0 => writer.put(0b1, 1),
                    1 => writer.put(0b011, 3),
                    2 => writer.put(0b000011, 6),
                    3 => writer.put(0b0000011, 7),
                    -1 => writer.put(0b010, 3),
                    -2 => writer.put(0b000010, 6),
                    -3 => writer.put(0b0000010, 7),
                    _ => unreachable!("|a1-b1| <= 3"),
                }
                a0 = a1 as isize;
                color = !color;
            } else {
                // Horizontal mode: two runs from a0.
                let a2 = coding_next(&current, a1 as isize, width);
                writer.put(0b001, 3);
                let run1 = if a0 < 0 { a1 } else { a1 - a0 as usize };
                write_run(&mut writer, run1, color);
                write_run(&mut writer, a2 - a1, !color);
                a0 = a2 as isize;
            }
            if a0 as usize >= width {
                break;
            }
        }
        std::mem::swap(&mut reference, &mut current);
    }

    // EOFB: two EOL codes.
    writer.put(0b000000000001, 12);
    writer.put(0b000000000001, 12);
    writer.finish()
}

/// The next changing element strictly right of `a0`, or `width`.
fn coding_next(changes: &[usize], a0: isize, width: usize) -> usize {
    changes
        .iter()
        .copied()
        .find(|&c| c as isize > a0)
        .unwrap_or(width)
}

/// b1 per T.6: the first changing element on the reference line to the
/// right of `a0` whose transition lands on the opposite of `color`.
/// Changes alternate starting with white-to-black, so the even-indexed
/// entries are transitions into black.
fn reference_b1(changes: &[usize], a0: isize, color: bool, width: usize) -> usize {
    for (i, &c) in changes.iter().enumerate() {
        if c >= width {
            break;
        }
        let into_black = i % 2 == 0;
        if c as isize > a0 && into_black != color {
            return c;
        }
    }
    width
}
