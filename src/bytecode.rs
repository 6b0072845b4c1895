//! VM bytecode file output. EightBall's bytecode has no header: the
//! compiler's whole code buffer is the file, byte for byte. The teacher's
//! `vexfile` writer prepends a data-length header because its VM loads a
//! combined data+code image at a fixed split; nothing here plays that role
//! (the compiled program is code only), so `write_bytecode` is a single
//! verbatim `write_all` rather than an adaptation of `vexfile::write`.

use std::io::{self, Write};

pub fn write_bytecode(code: &[u8], out: &mut impl Write) -> io::Result<()> {
    out.write_all(code)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn writes_code_verbatim_with_no_header() {
        let code = [0x01, 0x02, 0x03];
        let mut buf = Vec::new();
        write_bytecode(&code, &mut buf).unwrap();
        assert_eq!(buf, vec![0x01, 0x02, 0x03]);
    }
}
