//! Display surface used for diagnostics.
//!
//! The kernel core only needs to draw text and filled boxes when something
//! has gone wrong, so it depends on the small [`Surface`] trait rather than
//! on any particular framebuffer. [`TextModeSurface`] implements it on the
//! VGA text buffer that every PC boots with.
#![no_std]

use core::fmt;

/// Width of one glyph cell in pixels.
pub const CHAR_WIDTH: u32 = 8;
/// Height of one glyph cell in pixels.
pub const CHAR_HEIGHT: u32 = 16;

/// Color represented as 32-bit RGBA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    /// From a `0xRRGGBB` literal.
    pub const fn from_rgb(rgb: u32) -> Self {
        Self::new((rgb >> 16) as u8, (rgb >> 8) as u8, rgb as u8)
    }

    pub const WHITE: Color = Color::new(255, 255, 255);
    pub const BLACK: Color = Color::new(0, 0, 0);
    pub const RED: Color = Color::new(255, 0, 0);
    pub const GREEN: Color = Color::new(0, 255, 0);
    pub const BLUE: Color = Color::new(0, 0, 255);
    pub const YELLOW: Color = Color::new(255, 255, 0);
    pub const NAVY: Color = Color::from_rgb(0x000033);
}

/// Something the diagnostic paths can draw on. Coordinates are in pixels.
pub trait Surface {
    fn width(&self) -> u32;
    fn height(&self) -> u32;

    fn put_pixel(&mut self, x: u32, y: u32, color: Color);

    /// Draw `text` with its top-left corner at (`x`, `y`).
    fn draw_string(&mut self, x: u32, y: u32, text: &str, color: Color);

    fn fill_rect(&mut self, x: u32, y: u32, w: u32, h: u32, color: Color) {
        for row in y..y.saturating_add(h).min(self.height()) {
            for col in x..x.saturating_add(w).min(self.width()) {
                self.put_pixel(col, row, color);
            }
        }
    }

    /// Format into a stack buffer and draw the result. Output longer than
    /// one line is cut off.
    fn draw_fmt(&mut self, x: u32, y: u32, args: fmt::Arguments, color: Color) {
        let mut line = LineBuffer::<96>::new();
        let _ = fmt::write(&mut line, args);
        self.draw_string(x, y, line.as_str(), color);
    }
}

/// Fixed-capacity `fmt::Write` sink that silently truncates.
pub struct LineBuffer<const N: usize> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> LineBuffer<N> {
    pub const fn new() -> Self {
        Self { buf: [0; N], len: 0 }
    }

    pub fn as_str(&self) -> &str {
        // Only whole UTF-8 sequences are ever copied in.
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or("")
    }
}

impl<const N: usize> Default for LineBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Write for LineBuffer<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for ch in s.chars() {
            let mut utf8 = [0u8; 4];
            let bytes = ch.encode_utf8(&mut utf8).as_bytes();
            if self.len + bytes.len() > N {
                break;
            }
            self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
            self.len += bytes.len();
        }
        Ok(())
    }
}

// ── VGA text mode ────────────────────────────────────────────────

/// Physical address of the color text buffer.
pub const VGA_TEXT_BASE: usize = 0xB8000;
pub const VGA_COLUMNS: u32 = 80;
pub const VGA_ROWS: u32 = 25;

/// The 16 CGA/VGA text colors, in attribute order.
const PALETTE: [Color; 16] = [
    Color::from_rgb(0x000000),
    Color::from_rgb(0x0000AA),
    Color::from_rgb(0x00AA00),
    Color::from_rgb(0x00AAAA),
    Color::from_rgb(0xAA0000),
    Color::from_rgb(0xAA00AA),
    Color::from_rgb(0xAA5500),
    Color::from_rgb(0xAAAAAA),
    Color::from_rgb(0x555555),
    Color::from_rgb(0x5555FF),
    Color::from_rgb(0x55FF55),
    Color::from_rgb(0x55FFFF),
    Color::from_rgb(0xFF5555),
    Color::from_rgb(0xFF55FF),
    Color::from_rgb(0xFFFF55),
    Color::from_rgb(0xFFFFFF),
];

/// Nearest text-mode palette index for `color`.
pub fn vga_index(color: Color) -> u8 {
    let distance = |p: &Color| {
        let dr = p.r as i32 - color.r as i32;
        let dg = p.g as i32 - color.g as i32;
        let db = p.b as i32 - color.b as i32;
        dr * dr + dg * dg + db * db
    };
    let mut best = 0;
    for (i, p) in PALETTE.iter().enumerate() {
        if distance(p) < distance(&PALETTE[best]) {
            best = i;
        }
    }
    best as u8
}

/// [`Surface`] over an 80×25 text buffer. Each 8×16 pixel block maps to one
/// character cell; pixels paint the cell background.
pub struct TextModeSurface {
    base: usize,
}

impl TextModeSurface {
    /// # Safety
    ///
    /// `base` must point at an 80×25 array of `u16` cells that nothing else
    /// writes concurrently.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    fn cell_addr(&self, col: u32, row: u32) -> Option<usize> {
        (col < VGA_COLUMNS && row < VGA_ROWS)
            .then(|| self.base + ((row * VGA_COLUMNS + col) as usize) * 2)
    }

    fn read_cell(&self, addr: usize) -> u16 {
        unsafe { khal::mmio::volatile_read::<u16>(addr) }
    }

    fn write_cell(&mut self, addr: usize, value: u16) {
        unsafe { khal::mmio::volatile_write::<u16>(addr, value) }
    }
}

impl Surface for TextModeSurface {
    fn width(&self) -> u32 {
        VGA_COLUMNS * CHAR_WIDTH
    }

    fn height(&self) -> u32 {
        VGA_ROWS * CHAR_HEIGHT
    }

    fn put_pixel(&mut self, x: u32, y: u32, color: Color) {
        if let Some(addr) = self.cell_addr(x / CHAR_WIDTH, y / CHAR_HEIGHT) {
            let attr = (vga_index(color) as u16) << 4;
            self.write_cell(addr, (attr << 8) | b' ' as u16);
        }
    }

    fn fill_rect(&mut self, x: u32, y: u32, w: u32, h: u32, color: Color) {
        let first_col = x / CHAR_WIDTH;
        let first_row = y / CHAR_HEIGHT;
        let last_col = x.saturating_add(w).div_ceil(CHAR_WIDTH).min(VGA_COLUMNS);
        let last_row = y.saturating_add(h).div_ceil(CHAR_HEIGHT).min(VGA_ROWS);
        for row in first_row..last_row {
            for col in first_col..last_col {
                self.put_pixel(col * CHAR_WIDTH, row * CHAR_HEIGHT, color);
            }
        }
    }

    fn draw_string(&mut self, x: u32, y: u32, text: &str, color: Color) {
        let row = y / CHAR_HEIGHT;
        let mut col = x / CHAR_WIDTH;
        for byte in text.bytes() {
            let Some(addr) = self.cell_addr(col, row) else {
                break;
            };
            let background = (self.read_cell(addr) >> 12) & 0x0F;
            let attr = (background << 4) | vga_index(color) as u16;
            let glyph = if byte.is_ascii() && !byte.is_ascii_control() { byte } else { b'?' };
            self.write_cell(addr, (attr << 8) | glyph as u16);
            col += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_truncates_on_overflow() {
        let mut line = LineBuffer::<8>::new();
        fmt::write(&mut line, format_args!("EAX={:08X}", 0xDEADu32)).unwrap();
        assert_eq!(line.as_str(), "EAX=0000");
    }

    #[test]
    fn palette_matching() {
        assert_eq!(vga_index(Color::BLACK), 0);
        assert_eq!(vga_index(Color::WHITE), 15);
        assert_eq!(vga_index(Color::RED), 4);
        assert_eq!(vga_index(Color::NAVY), 0);
    }

    #[test]
    fn text_surface_writes_cells() {
        let mut cells = [0u16; (VGA_COLUMNS * VGA_ROWS) as usize];
        let mut surface = unsafe { TextModeSurface::new(cells.as_mut_ptr() as usize) };

        surface.fill_rect(0, 0, 16, 16, Color::BLUE);
        surface.draw_string(8, 0, "Hi", Color::WHITE);
        surface.draw_string(78 * CHAR_WIDTH, 16, "clip", Color::WHITE);

        assert_eq!(cells[0], 0x1020);
        assert_eq!(cells[1], 0x1F00 | b'H' as u16);
        assert_eq!(cells[2], 0x0F00 | b'i' as u16);
        assert_eq!(cells[80 + 78], 0x0F00 | b'c' as u16);
        assert_eq!(cells[80 + 79], 0x0F00 | b'l' as u16);
        assert_eq!(cells[2 * 80], 0);
    }
}
